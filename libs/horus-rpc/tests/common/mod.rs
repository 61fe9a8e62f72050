#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::ready,
    rc::Rc,
    time::Instant,
};

use horus_rpc::{
    Connection, ConnectionConfig, Error, MemoryTransport, Message, MessageHandler, RpcClient,
    RpcContext,
    RpcEndpoint, RpcHandler, RpcMessage, RpcOptions, ServiceHandler, SubscriberSet, Transport,
    TransportEvent, client_handler, connected,
    handler::{dispatch, dispatch_one_way, unknown_method},
    no_message_handler,
};
use horus_runtime::{
    AnyFuture, yield_now,
    util::{OneshotTx, oneshot},
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Yields until `cond` holds, failing the test if it never does.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        yield_now().await;
    }
    panic!("condition not reached");
}

pub async fn settle() {
    for _ in 0..16 {
        yield_now().await;
    }
}

pub mod echo {
    pub const SERVICE_ID: u16 = 1;
    pub const ECHO: u32 = 1;
    pub const GATED_ECHO: u32 = 2;
    pub const NOTE: u32 = 3;
    pub const SUBSCRIBE: u32 = 4;
}

pub mod listener {
    pub const SERVICE_ID: u16 = 2;
    pub const ON_EVENT: u32 = 1;
}

/// State shared by every server-side connection of a test.
#[derive(Default)]
pub struct EchoState {
    /// One sender per gated request still waiting, in arrival order.
    pub gates: RefCell<VecDeque<OneshotTx<()>>>,
    pub request_ids: RefCell<Vec<u32>>,
    pub notes: RefCell<Vec<String>>,
    pub subscribers: RefCell<SubscriberSet<ListenerClient>>,
}

impl EchoState {
    pub fn open_gate(&self) {
        let gate = self.gates.borrow_mut().pop_front();
        gate.expect("no gated request waiting").send(());
    }
}

pub struct EchoHandler(pub Rc<EchoState>);

impl RpcHandler for EchoHandler {
    const SERVICE_ID: u16 = echo::SERVICE_ID;
    const SERVICE_FULL_NAME: &'static str = "horus.test.Echo";

    fn handle(&self, ctx: RpcContext, request: RpcMessage) -> AnyFuture<Result<RpcMessage, Error>> {
        let state = self.0.clone();
        state.request_ids.borrow_mut().push(request.request_id);
        match request.method_id {
            echo::ECHO => dispatch(&request, |text: String| ready(Ok(text))),
            echo::GATED_ECHO => {
                let (tx, rx) = oneshot();
                state.gates.borrow_mut().push_back(tx);
                dispatch(&request, move |text: String| async move {
                    rx.wait().await;
                    Ok(text)
                })
            }
            echo::NOTE => dispatch_one_way(&request, move |note: String| {
                state.notes.borrow_mut().push(note);
                ready(Ok(()))
            }),
            echo::SUBSCRIBE => dispatch(&request, move |()| {
                state.subscribers.borrow_mut().add::<()>(&ctx);
                ready(Ok(()))
            }),
            _ => unknown_method(&request),
        }
    }
}

#[derive(Clone)]
pub struct EchoClient {
    endpoint: Rc<dyn RpcEndpoint>,
}

impl RpcClient for EchoClient {
    const SERVICE_ID: u16 = echo::SERVICE_ID;
    const SERVICE_FULL_NAME: &'static str = "horus.test.Echo";

    fn from_endpoint(endpoint: Rc<dyn RpcEndpoint>) -> Self {
        EchoClient { endpoint }
    }

    fn endpoint(&self) -> &Rc<dyn RpcEndpoint> {
        &self.endpoint
    }
}

impl EchoClient {
    pub fn echo(&self, text: &str) -> AnyFuture<Result<String, Error>> {
        self.invoke(echo::ECHO, &text.to_string(), &RpcOptions::default())
    }

    pub fn gated_echo(&self, text: &str) -> AnyFuture<Result<String, Error>> {
        self.invoke(echo::GATED_ECHO, &text.to_string(), &RpcOptions::default())
    }

    pub fn note(&self, note: &str) -> AnyFuture<Result<(), Error>> {
        self.invoke_one_way(echo::NOTE, &note.to_string(), &RpcOptions::default())
    }

    pub fn subscribe(&self) -> AnyFuture<Result<(), Error>> {
        self.invoke(echo::SUBSCRIBE, &(), &RpcOptions::default())
    }
}

#[derive(Default)]
pub struct ListenerState {
    pub events: RefCell<Vec<u32>>,
}

pub struct ListenerHandler(pub Rc<ListenerState>);

impl RpcHandler for ListenerHandler {
    const SERVICE_ID: u16 = listener::SERVICE_ID;
    const SERVICE_FULL_NAME: &'static str = "horus.test.Listener";

    fn handle(&self, _: RpcContext, request: RpcMessage) -> AnyFuture<Result<RpcMessage, Error>> {
        let state = self.0.clone();
        match request.method_id {
            listener::ON_EVENT => dispatch_one_way(&request, move |event: u32| {
                state.events.borrow_mut().push(event);
                ready(Ok(()))
            }),
            _ => unknown_method(&request),
        }
    }
}

#[derive(Clone)]
pub struct ListenerClient {
    endpoint: Rc<dyn RpcEndpoint>,
}

impl RpcClient for ListenerClient {
    const SERVICE_ID: u16 = listener::SERVICE_ID;
    const SERVICE_FULL_NAME: &'static str = "horus.test.Listener";

    fn from_endpoint(endpoint: Rc<dyn RpcEndpoint>) -> Self {
        ListenerClient { endpoint }
    }

    fn endpoint(&self) -> &Rc<dyn RpcEndpoint> {
        &self.endpoint
    }
}

impl ListenerClient {
    pub fn on_event(&self, event: u32) -> AnyFuture<Result<(), Error>> {
        self.invoke_one_way(listener::ON_EVENT, &event, &RpcOptions::default())
    }
}

pub struct Peers {
    pub client: Rc<Connection<MemoryTransport>>,
    pub server: Rc<Connection<MemoryTransport>>,
    pub echo: EchoClient,
}

pub fn echo_server(
    transport: MemoryTransport,
    state: Rc<EchoState>,
) -> Rc<Connection<MemoryTransport>> {
    let handlers: Vec<Rc<dyn ServiceHandler>> = vec![Rc::new(EchoHandler(state))];
    Connection::open(transport, client_handler(handlers), ConnectionConfig::default())
}

/// A connected client/server pair serving [`EchoHandler`] over a [`MemoryTransport`].
pub async fn connect_echo(state: Rc<EchoState>) -> Peers {
    connect_echo_with(state, no_message_handler()).await
}

pub async fn connect_echo_with(state: Rc<EchoState>, client_handler: MessageHandler) -> Peers {
    init_tracing();
    let (a, b) = MemoryTransport::pair();
    let server = echo_server(b, state);
    let client = Connection::open(a, client_handler, ConnectionConfig::default());
    connected(&*client).await.expect("client connects");
    let echo = EchoClient::from_endpoint(client.clone());
    Peers {
        client,
        server,
        echo,
    }
}

/// Wraps a [`MemoryTransport`], failing the first `failures` sends and recording when each send
/// was attempted.
pub struct FlakyTransport {
    inner: MemoryTransport,
    failures: Cell<usize>,
    pub attempts: Rc<RefCell<Vec<Instant>>>,
}

impl FlakyTransport {
    pub fn new(inner: MemoryTransport, failures: usize) -> Self {
        FlakyTransport {
            inner,
            failures: Cell::new(failures),
            attempts: Rc::default(),
        }
    }

    pub fn always_failing(inner: MemoryTransport) -> Self {
        Self::new(inner, usize::MAX)
    }
}

impl Transport for FlakyTransport {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        self.attempts.borrow_mut().push(Instant::now());
        let failures = self.failures.get();
        if failures > 0 {
            self.failures.set(failures - 1);
            return Err(Error::Transport("flaky".to_string()));
        }
        self.inner.send(bytes).await
    }

    async fn recv(&self) -> Option<TransportEvent> {
        self.inner.recv().await
    }
}

/// Wraps a [`MemoryTransport`], decoding and keeping every envelope this end sends.
pub struct RecordingTransport {
    inner: MemoryTransport,
    pub sent: Rc<RefCell<Vec<RpcMessage>>>,
}

impl RecordingTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        RecordingTransport {
            inner,
            sent: Rc::default(),
        }
    }
}

impl Transport for RecordingTransport {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let message = RpcMessage::from_bytes(bytes).expect("connection sends valid envelopes");
        self.sent.borrow_mut().push(message);
        self.inner.send(bytes).await
    }

    async fn recv(&self) -> Option<TransportEvent> {
        self.inner.recv().await
    }
}

/// Like [`connect_echo`], but both peers record the envelopes they send.
pub struct RecordedPeers {
    pub client: Rc<Connection<RecordingTransport>>,
    pub server: Rc<Connection<RecordingTransport>>,
    pub echo: EchoClient,
}

impl RecordedPeers {
    pub fn client_sent(&self) -> Vec<RpcMessage> {
        self.client.transport().sent.borrow().clone()
    }

    pub fn server_sent(&self) -> Vec<RpcMessage> {
        self.server.transport().sent.borrow().clone()
    }
}

pub async fn connect_echo_recorded(state: Rc<EchoState>) -> RecordedPeers {
    init_tracing();
    let (a, b) = MemoryTransport::pair();
    let handlers: Vec<Rc<dyn ServiceHandler>> = vec![Rc::new(EchoHandler(state))];
    let server = Connection::open(
        RecordingTransport::new(b),
        client_handler(handlers),
        ConnectionConfig::default(),
    );
    let client = Connection::open(
        RecordingTransport::new(a),
        no_message_handler(),
        ConnectionConfig::default(),
    );
    connected(&*client).await.expect("client connects");
    let echo = EchoClient::from_endpoint(client.clone());
    RecordedPeers {
        client,
        server,
        echo,
    }
}
