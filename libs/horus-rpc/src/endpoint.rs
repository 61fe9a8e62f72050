use std::{
    cell::RefCell,
    fmt,
    future::poll_fn,
    rc::Rc,
    task::{Poll, Waker},
};

use horus_runtime::{AnyFuture, function::MoveOnlyFn, one_of, one_of::OneOf};
use tracing::debug;

use crate::{Error, RetryPolicy, RpcMessage};

/// `Error` lifecycle events tolerated by [`connected`] before it gives up.
const MAX_CONNECT_ERRORS: usize = 4;

/// Additional arguments used when sending RPCs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    pub retry_policy: RetryPolicy,
}

impl From<RetryPolicy> for RpcOptions {
    fn from(retry_policy: RetryPolicy) -> Self {
        RpcOptions { retry_policy }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectedEvent;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    /// Empty when the connection ended normally.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub error: Error,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownEvent;

one_of! {
    /// A transition in the lifecycle of an endpoint.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LifecycleEvent {
        Connected(ConnectedEvent),
        Disconnected(DisconnectedEvent),
        Error(ErrorEvent),
        Shutdown(ShutdownEvent),
    }
}

pub type LifecycleCallback = MoveOnlyFn<LifecycleEvent, ()>;

/// The unit peers use to exchange envelopes.
///
/// There is deliberately no "is connected" query: it would be stale by the time it is read.
/// Sending on a disconnected endpoint fails with [`Error::Disconnected`] instead.
pub trait RpcEndpoint {
    /// A URI like `ws://10.0.0.4:8080`, for logs only.
    fn uri(&self) -> &str;

    /// Sends a one-way message, resolving once the transport has accepted the bytes.
    fn send(&self, message: RpcMessage, options: &RpcOptions) -> AnyFuture<Result<(), Error>>;

    /// Sends a two-way request and resolves with its response. Sets `message.request_id`.
    fn send_with_response(
        &self,
        message: RpcMessage,
        options: &RpcOptions,
    ) -> AnyFuture<Result<RpcMessage, Error>>;

    /// Replaces the lifecycle callback. Events are not buffered: a new callback only sees
    /// transitions that happen after it was set.
    fn set_lifecycle_callback(&self, callback: Option<LifecycleCallback>);
}

/// Whether `a` and `b` are the same endpoint object.
pub fn same_endpoint(a: &Rc<dyn RpcEndpoint>, b: &Rc<dyn RpcEndpoint>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Context of a running RPC handler.
#[derive(Clone)]
pub struct RpcContext {
    pub endpoint: Rc<dyn RpcEndpoint>,
}

impl RpcContext {
    pub fn new(endpoint: Rc<dyn RpcEndpoint>) -> Self {
        RpcContext { endpoint }
    }
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcContext")
            .field("endpoint", &self.endpoint.uri())
            .finish()
    }
}

/// Handles a received request. One-way requests resolve to an empty message.
pub type MessageHandler =
    MoveOnlyFn<(RpcContext, RpcMessage), AnyFuture<Result<RpcMessage, Error>>>;

#[derive(Default)]
struct ConnectState {
    outcome: Option<Result<(), Error>>,
    errors: usize,
    waker: Option<Waker>,
}

/// Waits for `endpoint` to report [`LifecycleEvent::Connected`].
///
/// Takes over the endpoint's lifecycle callback and clears it once done. Fails on disconnection,
/// on shutdown, or after more than four errors.
pub async fn connected(endpoint: &dyn RpcEndpoint) -> Result<(), Error> {
    struct ClearCallback<'a>(&'a dyn RpcEndpoint);

    impl Drop for ClearCallback<'_> {
        fn drop(&mut self) {
            self.0.set_lifecycle_callback(None);
        }
    }

    let state = Rc::new(RefCell::new(ConnectState::default()));
    let callback_state = state.clone();
    endpoint.set_lifecycle_callback(Some(MoveOnlyFn::new(move |event: LifecycleEvent| {
        let mut state = callback_state.borrow_mut();
        if state.outcome.is_some() {
            return;
        }
        let outcome = match event {
            LifecycleEvent::Connected(_) => Ok(()),
            LifecycleEvent::Disconnected(event) => {
                debug!(reason = %event.reason, "disconnected while connecting");
                Err(Error::Disconnected)
            }
            LifecycleEvent::Error(event) => {
                state.errors += 1;
                debug!(error = %event.error, errors = state.errors, "error while connecting");
                if state.errors <= MAX_CONNECT_ERRORS {
                    return;
                }
                Err(Error::Disconnected)
            }
            LifecycleEvent::Shutdown(_) => Err(Error::Shutdown),
        };
        state.outcome = Some(outcome);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    })));
    let _clear = ClearCallback(endpoint);

    poll_fn(|cx| {
        let mut state = state.borrow_mut();
        match state.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    })
    .await
}

impl LifecycleEvent {
    pub fn connected() -> Self {
        ConnectedEvent.into()
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        DisconnectedEvent {
            reason: reason.into(),
        }
        .into()
    }

    pub fn error(error: Error) -> Self {
        ErrorEvent { error }.into()
    }

    pub fn shutdown() -> Self {
        ShutdownEvent.into()
    }

    pub fn name(&self) -> &'static str {
        self.alternative_name()
    }
}
