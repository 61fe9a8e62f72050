//! The byte-level link underneath a [`Connection`](crate::Connection).

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::trace;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message(Vec<u8>),
    Closed { reason: String },
    Error(String),
}

/// A message-oriented, bidirectional byte transport.
///
/// `recv` resolving to `None` means the transport is gone for good. A transport that can
/// reconnect reports [`TransportEvent::Closed`] and later [`TransportEvent::Connected`] instead.
pub trait Transport: 'static {
    fn uri(&self) -> &str;
    fn send(&self, bytes: &[u8]) -> impl Future<Output = Result<(), Error>>;
    fn recv(&self) -> impl Future<Output = Option<TransportEvent>>;
}

/// One end of an in-process transport created by [`MemoryTransport::pair`].
///
/// Each end keeps its own queue alive, so `recv` never reports the transport as gone; closing is
/// signalled with [`TransportEvent::Closed`].
pub struct MemoryTransport {
    uri: String,
    tx: flume::Sender<TransportEvent>,
    rx: flume::Receiver<TransportEvent>,
    // this end's own queue, for injected events
    inbox: flume::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Two connected ends. Each starts with a queued [`TransportEvent::Connected`].
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        Self::pair_with_uris("memory://a", "memory://b")
    }

    pub fn pair_with_uris(a: &str, b: &str) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        let open = Arc::new(AtomicBool::new(true));
        let _ = a_tx.send(TransportEvent::Connected);
        let _ = b_tx.send(TransportEvent::Connected);
        let a = MemoryTransport {
            uri: a.to_string(),
            tx: b_tx.clone(),
            rx: a_rx,
            inbox: a_tx.clone(),
            open: open.clone(),
        };
        let b = MemoryTransport {
            uri: b.to_string(),
            tx: a_tx,
            rx: b_rx,
            inbox: b_tx,
            open,
        };
        (a, b)
    }

    /// Closes the link in both directions. Both ends observe [`TransportEvent::Closed`].
    pub fn close(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            for queue in [&self.tx, &self.inbox] {
                let _ = queue.send(TransportEvent::Closed {
                    reason: reason.to_string(),
                });
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queues an event for this end's own receiver, as if the link had produced it.
    pub fn inject(&self, event: TransportEvent) -> Result<(), Error> {
        self.inbox.send(event).map_err(|_| Error::Disconnected)
    }
}

impl Transport for MemoryTransport {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::Disconnected);
        }
        trace!(uri = %self.uri, len = bytes.len(), "memory transport send");
        self.tx
            .send_async(TransportEvent::Message(bytes.to_vec()))
            .await
            .map_err(|_| Error::Disconnected)
    }

    async fn recv(&self) -> Option<TransportEvent> {
        self.rx.recv_async().await.ok()
    }
}
