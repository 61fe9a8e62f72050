//! RPC layer of the horus SDK: envelopes, endpoints, typed clients and handlers, and subscriber
//! bookkeeping, all running on the [`horus_runtime`] event loop.

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod message;
pub mod retry;
pub mod subscriber;
pub mod transport;

pub use client::RpcClient;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use endpoint::{
    LifecycleCallback, LifecycleEvent, MessageHandler, RpcContext, RpcEndpoint, RpcOptions,
    connected, same_endpoint,
};
pub use error::Error;
pub use handler::{RpcHandler, ServiceHandler, client_handler, no_message_handler};
pub use message::{
    Message, ONE_WAY_REQUEST_ID, RESPONSE_METHOD_ID, RpcMessage, TWO_WAY_REQUEST_ID_MAX,
    TWO_WAY_REQUEST_ID_MIN, Version,
};
pub use retry::{Backoff, RetryPolicy, UNLIMITED_RETRIES};
pub use subscriber::{RpcDisconnectionError, SubscriberResponse, SubscriberSet};
pub use transport::{MemoryTransport, Transport, TransportEvent};
