//! An [`RpcEndpoint`] driving a [`Transport`] on the current thread's event loop.
//!
//! Two-way requests draw their id from a fixed pool of `response_capacity` ids. An id goes back
//! to the pool when its response is consumed. A request abandoned after it was sent (dropped, or
//! past its deadline) sends a cancellation and keeps its id reserved until the peer's response
//! arrives anyway or the transport reconnects, so a late response can never be mistaken for the
//! answer to a newer request.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{Future, poll_fn},
    rc::{Rc, Weak},
    task::{Poll, Waker},
    time::Instant,
};

use horus_runtime::{AnyFuture, future::timeout_at, sleep_until, util::CancelToken};
use tracing::{debug, trace, warn};

use crate::{
    ConnectionConfig, Error, LifecycleCallback, LifecycleEvent, Message, MessageHandler,
    ONE_WAY_REQUEST_ID, RESPONSE_METHOD_ID, RetryPolicy, RpcContext, RpcEndpoint, RpcMessage,
    RpcOptions, TWO_WAY_REQUEST_ID_MIN, Version,
    transport::{Transport, TransportEvent},
};

enum Slot {
    Free,
    Pending {
        response: Option<Result<RpcMessage, Error>>,
        waker: Option<Waker>,
    },
    /// Abandoned by its caller; waiting for the peer's response before reuse.
    Retired,
}

enum Delivery {
    Delivered,
    Stale,
    Unexpected,
}

struct RequestIds {
    slots: Vec<Slot>,
    waiters: Vec<Waker>,
}

impl RequestIds {
    fn new(capacity: u32) -> Self {
        RequestIds {
            slots: (0..capacity.max(1)).map(|_| Slot::Free).collect(),
            waiters: Vec::new(),
        }
    }

    fn index(&self, id: u32) -> Option<usize> {
        let index = usize::try_from(id.checked_sub(TWO_WAY_REQUEST_ID_MIN)?).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    /// Reserves the lowest free id.
    fn allocate(&mut self) -> Option<u32> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))?;
        self.slots[index] = Slot::Pending {
            response: None,
            waker: None,
        };
        let index = u32::try_from(index).ok()?;
        Some(index + TWO_WAY_REQUEST_ID_MIN)
    }

    fn release(&mut self, index: usize) {
        self.slots[index] = Slot::Free;
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    fn wait_for_release(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }

    fn deliver(&mut self, id: u32, response: Result<RpcMessage, Error>) -> Delivery {
        let Some(index) = self.index(id) else {
            return Delivery::Unexpected;
        };
        if matches!(self.slots[index], Slot::Retired) {
            self.release(index);
            return Delivery::Stale;
        }
        if let Slot::Pending {
            response: slot,
            waker,
        } = &mut self.slots[index]
        {
            if slot.is_none() {
                *slot = Some(response);
                if let Some(waker) = waker.take() {
                    waker.wake();
                }
                return Delivery::Delivered;
            }
        }
        Delivery::Unexpected
    }

    fn is_settled(&self, id: u32) -> bool {
        match self.index(id).map(|index| &self.slots[index]) {
            Some(Slot::Pending { response, .. }) => response.is_some(),
            _ => true,
        }
    }

    fn poll_response(&mut self, id: u32, cx: &Waker) -> Poll<Result<RpcMessage, Error>> {
        let Some(index) = self.index(id) else {
            return Poll::Ready(Err(Error::InvalidRequestId { request_id: id }));
        };
        let Slot::Pending { response, waker } = &mut self.slots[index] else {
            return Poll::Ready(Err(Error::InvalidRequestId { request_id: id }));
        };
        if let Some(response) = response.take() {
            self.release(index);
            return Poll::Ready(response);
        }
        match waker {
            Some(waker) if waker.will_wake(cx) => {}
            _ => *waker = Some(cx.clone()),
        }
        Poll::Pending
    }

    /// Gives up on `id`. Returns whether the id was retired, i.e. a response is still expected.
    fn abandon(&mut self, id: u32, sent: bool) -> bool {
        let Some(index) = self.index(id) else {
            return false;
        };
        let retire = match &self.slots[index] {
            Slot::Pending { response: None, .. } => sent,
            Slot::Pending { .. } => false,
            Slot::Free | Slot::Retired => return false,
        };
        if retire {
            self.slots[index] = Slot::Retired;
        } else {
            self.release(index);
        }
        retire
    }

    /// Fails every pending request with `error` and frees retired ids.
    fn reset(&mut self, error: &Error) {
        for slot in &mut self.slots {
            match slot {
                Slot::Pending { response, waker } => {
                    if response.is_none() {
                        *response = Some(Err(error.clone()));
                    }
                    if let Some(waker) = waker.take() {
                        waker.wake();
                    }
                }
                Slot::Retired => *slot = Slot::Free,
                Slot::Free => {}
            }
        }
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, Slot::Free))
            .count()
    }
}

struct State {
    connected: bool,
    shut_down: bool,
    ids: RequestIds,
}

pub struct Connection<T: Transport> {
    this: Weak<Self>,
    transport: Rc<T>,
    config: ConnectionConfig,
    state: RefCell<State>,
    handler: RefCell<MessageHandler>,
    lifecycle: RefCell<Option<LifecycleCallback>>,
    // bumped on every `set_lifecycle_callback`, so a callback that replaces itself sticks
    lifecycle_generation: Cell<u64>,
    cancel: CancelToken,
}

impl<T: Transport> Connection<T> {
    /// Wraps `transport` and starts receiving on the current thread's event loop.
    ///
    /// Incoming requests go to `handler`. The connection only accepts sends once the transport
    /// reports [`TransportEvent::Connected`]; [`connected`](crate::connected) waits for that.
    pub fn open(transport: T, handler: MessageHandler, config: ConnectionConfig) -> Rc<Self> {
        let transport = Rc::new(transport);
        let cancel = CancelToken::new();
        let connection = Rc::new_cyclic(|this| Connection {
            this: this.clone(),
            transport: transport.clone(),
            state: RefCell::new(State {
                connected: false,
                shut_down: false,
                ids: RequestIds::new(config.response_capacity),
            }),
            config,
            handler: RefCell::new(handler),
            lifecycle: RefCell::new(None),
            lifecycle_generation: Cell::new(0),
            cancel: cancel.clone(),
        });
        horus_runtime::spawn(receive_loop(
            transport,
            Rc::downgrade(&connection),
            cancel,
        ));
        connection
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Two-way ids currently reserved, including retired ones.
    pub fn requests_in_flight(&self) -> usize {
        self.state.borrow().ids.in_flight()
    }

    /// Stops receiving and fails every pending request with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.connected = false;
            state.ids.reset(&Error::Shutdown);
        }
        self.cancel.cancel();
        debug!(uri = self.uri(), "connection shut down");
        self.emit(LifecycleEvent::shutdown());
    }

    fn check_open(&self) -> Result<(), Error> {
        let state = self.state.borrow();
        if state.shut_down {
            Err(Error::Shutdown)
        } else if !state.connected {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    fn shutdown_error(&self) -> Option<Error> {
        self.state.borrow().shut_down.then_some(Error::Shutdown)
    }

    fn emit(&self, event: LifecycleEvent) {
        let generation = self.lifecycle_generation.get();
        let Some(mut callback) = self.lifecycle.borrow_mut().take() else {
            trace!(event = event.name(), "no lifecycle callback");
            return;
        };
        callback.call(event);
        if self.lifecycle_generation.get() == generation {
            *self.lifecycle.borrow_mut() = Some(callback);
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                {
                    let mut state = self.state.borrow_mut();
                    state.connected = true;
                    state.ids.reset(&Error::Disconnected);
                }
                debug!(uri = self.uri(), "connected");
                self.emit(LifecycleEvent::connected());
            }
            TransportEvent::Closed { reason } => {
                {
                    let mut state = self.state.borrow_mut();
                    state.connected = false;
                    state.ids.reset(&Error::Disconnected);
                }
                debug!(uri = self.uri(), %reason, "disconnected");
                self.emit(LifecycleEvent::disconnected(reason));
            }
            TransportEvent::Error(error) => {
                warn!(uri = self.uri(), %error, "transport error");
                self.emit(LifecycleEvent::error(Error::Transport(error)));
            }
            TransportEvent::Message(bytes) => self.handle_bytes(&bytes),
        }
    }

    fn handle_bytes(&self, bytes: &[u8]) {
        let message = match RpcMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(uri = self.uri(), %err, "received invalid envelope");
                self.emit(LifecycleEvent::error(err));
                return;
            }
        };
        trace!(
            service_id = message.service_id,
            method_id = message.method_id,
            request_id = message.request_id,
            "received envelope"
        );
        if message.cancel {
            // the response to a cancelled request is still sent, so there is nothing to undo
            trace!(request_id = message.request_id, "ignoring cancellation");
            return;
        }
        if message.is_response() {
            self.deliver(message);
        } else {
            self.dispatch(message);
        }
    }

    fn deliver(&self, mut message: RpcMessage) {
        let request_id = message.request_id;
        let response = match message.error.take() {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(message),
        };
        let delivery = self.state.borrow_mut().ids.deliver(request_id, response);
        match delivery {
            Delivery::Delivered => trace!(request_id, "response delivered"),
            Delivery::Stale => debug!(request_id, "discarded response to abandoned request"),
            Delivery::Unexpected => {
                warn!(uri = self.uri(), request_id, "response to unknown request id");
                self.emit(LifecycleEvent::error(Error::InvalidRequestId { request_id }));
            }
        }
    }

    fn dispatch(&self, request: RpcMessage) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let (service_id, method_id, request_id) =
            (request.service_id, request.method_id, request.request_id);
        let context = RpcContext::new(this.clone());
        let response = self.handler.borrow_mut().call((context, request));
        horus_runtime::spawn(async move {
            let result = response.await;
            if request_id == ONE_WAY_REQUEST_ID {
                if let Err(err) = result {
                    warn!(?err, service_id, method_id, "one-way handler failed");
                }
                return;
            }
            let response = match result {
                Ok(response) => RpcMessage {
                    version: Version::One,
                    service_id,
                    method_id: RESPONSE_METHOD_ID,
                    request_id,
                    cancel: false,
                    ..response
                },
                Err(err) => {
                    if matches!(
                        err,
                        Error::UnknownMethod { .. } | Error::UnknownService { .. }
                    ) {
                        this.emit(LifecycleEvent::error(err.clone()));
                    }
                    debug!(?err, service_id, method_id, request_id, "handler failed");
                    RpcMessage::error_response(service_id, request_id, err.to_string())
                }
            };
            if let Err(err) = this.send_response(response).await {
                debug!(?err, request_id, "response not sent");
            }
        });
    }

    async fn send_response(&self, response: RpcMessage) -> Result<(), Error> {
        let bytes = response.to_bytes()?;
        let policy = self.config.response_retry_policy();
        // a peer that went away will not be waiting for the response anymore
        self.send_bytes(&bytes, policy, || self.check_open().err())
            .await
    }

    /// Hands `bytes` to the transport, retrying failures as `policy` allows.
    async fn send_bytes(
        &self,
        bytes: &[u8],
        policy: RetryPolicy,
        abort: impl Fn() -> Option<Error>,
    ) -> Result<(), Error> {
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;
        loop {
            if policy.is_expired(Instant::now()) {
                debug!(uri = self.uri(), attempt, "deadline passed");
                return Err(Error::Disconnected);
            }
            if let Some(err) = abort() {
                return Err(err);
            }
            attempt += 1;
            let err = match self.transport.send(bytes).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let Some(delay) = backoff.next() else {
                debug!(uri = self.uri(), ?err, attempt, "send failed, giving up");
                return Err(Error::Disconnected);
            };
            trace!(uri = self.uri(), ?err, attempt, ?delay, "send failed, retrying");
            let retry_at = match (Instant::now().checked_add(delay), policy.deadline) {
                (Some(at), Some(deadline)) => at.min(deadline),
                (Some(at), None) => at,
                (None, Some(deadline)) => deadline,
                (None, None) => return Err(Error::Disconnected),
            };
            sleep_until(retry_at).await;
        }
    }

    fn allocate_id(&self) -> impl Future<Output = Result<u32, Error>> + '_ {
        poll_fn(move |cx| {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return Poll::Ready(Err(Error::Shutdown));
            }
            if !state.connected {
                return Poll::Ready(Err(Error::Disconnected));
            }
            match state.ids.allocate() {
                Some(id) => Poll::Ready(Ok(id)),
                None => {
                    state.ids.wait_for_release(cx.waker());
                    Poll::Pending
                }
            }
        })
    }

    fn wait_response(&self, id: u32) -> impl Future<Output = Result<RpcMessage, Error>> + '_ {
        poll_fn(move |cx| self.state.borrow_mut().ids.poll_response(id, cx.waker()))
    }
}

/// Releases or retires a request id when the request future goes away.
struct PendingRequest<T: Transport> {
    connection: Rc<Connection<T>>,
    id: u32,
    service_id: u16,
    sent: bool,
    settled: bool,
}

impl<T: Transport> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let retired = self
            .connection
            .state
            .borrow_mut()
            .ids
            .abandon(self.id, self.sent);
        if !retired {
            return;
        }
        debug!(request_id = self.id, "request abandoned, sending cancellation");
        let connection = self.connection.clone();
        let cancellation = RpcMessage::cancellation(self.service_id, self.id);
        let spawned = horus_runtime::try_spawn(async move {
            let sent = match cancellation.to_bytes() {
                Ok(bytes) => {
                    connection
                        .send_bytes(&bytes, RetryPolicy::do_not_retry(), || {
                            connection.check_open().err()
                        })
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                debug!(?err, request_id = cancellation.request_id, "cancellation not sent");
            }
        });
        if spawned.is_none() {
            trace!(request_id = self.id, "event loop gone, cancellation dropped");
        }
    }
}

impl<T: Transport> RpcEndpoint for Connection<T> {
    fn uri(&self) -> &str {
        self.transport.uri()
    }

    fn send(&self, mut message: RpcMessage, options: &RpcOptions) -> AnyFuture<Result<(), Error>> {
        let Some(this) = self.this.upgrade() else {
            return AnyFuture::ready(Err(Error::Shutdown));
        };
        if let Err(err) = self.check_open() {
            return AnyFuture::ready(Err(err));
        }
        message.version = Version::One;
        message.request_id = ONE_WAY_REQUEST_ID;
        let policy = options.retry_policy;
        AnyFuture::new(async move {
            let bytes = message.to_bytes()?;
            this.send_bytes(&bytes, policy, || this.shutdown_error())
                .await
        })
    }

    fn send_with_response(
        &self,
        mut message: RpcMessage,
        options: &RpcOptions,
    ) -> AnyFuture<Result<RpcMessage, Error>> {
        let Some(this) = self.this.upgrade() else {
            return AnyFuture::ready(Err(Error::Shutdown));
        };
        if let Err(err) = self.check_open() {
            return AnyFuture::ready(Err(err));
        }
        let policy = options.retry_policy;
        AnyFuture::new(async move {
            let id = match policy.deadline {
                Some(deadline) => timeout_at(deadline, this.allocate_id())
                    .await
                    .map_err(|_| Error::Disconnected)??,
                None => this.allocate_id().await?,
            };
            let mut request = PendingRequest {
                connection: this.clone(),
                id,
                service_id: message.service_id,
                sent: false,
                settled: false,
            };
            message.version = Version::One;
            message.request_id = id;
            message.cancel = false;
            let bytes = message.to_bytes()?;
            this.send_bytes(&bytes, policy, || {
                this.state
                    .borrow()
                    .ids
                    .is_settled(id)
                    .then_some(Error::Disconnected)
            })
            .await?;
            request.sent = true;

            let response = match policy.deadline {
                Some(deadline) => timeout_at(deadline, this.wait_response(id))
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => this.wait_response(id).await,
            };
            request.settled = true;
            response
        })
    }

    fn set_lifecycle_callback(&self, callback: Option<LifecycleCallback>) {
        self.lifecycle_generation
            .set(self.lifecycle_generation.get().wrapping_add(1));
        *self.lifecycle.borrow_mut() = callback;
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Connection")
            .field("uri", &self.uri())
            .field("connected", &state.connected)
            .field("shut_down", &state.shut_down)
            .field("requests_in_flight", &state.ids.in_flight())
            .finish()
    }
}

async fn receive_loop<T: Transport>(
    transport: Rc<T>,
    connection: Weak<Connection<T>>,
    cancel: CancelToken,
) {
    loop {
        let cancelled = async {
            cancel.wait().await;
            None::<TransportEvent>
        };
        let Some(event) = futures_lite::future::race(transport.recv(), cancelled).await else {
            if !cancel.is_cancelled() {
                if let Some(connection) = connection.upgrade() {
                    debug!(uri = transport.uri(), "transport gone");
                    connection.shutdown();
                }
            }
            break;
        };
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.handle_event(event);
    }
    trace!(uri = transport.uri(), "receive loop stopped");
}
