//! Server-side registry of peers that asked to be notified.

use std::{
    fmt,
    future::{Future, ready},
    time::Duration,
};

use horus_runtime::{
    TryFutureExt,
    future::join_all,
    owned::{Borrowed, Owned},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, RpcClient, RpcContext, same_endpoint};

/// How long [`SubscriberSet::notify`] waits for each subscriber.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(4);

/// Payload describing why an operation on a peer could not be carried out.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcDisconnectionError {
    pub target_service: String,
    pub target_uri: String,
    pub details: String,
}

/// Responses of unsubscribe methods, which report a missing subscriber in-band.
pub trait SubscriberResponse {
    fn disconnection_error(error: RpcDisconnectionError) -> Self;
}

/// The clients of every subscribed peer, at most one per endpoint.
pub struct SubscriberSet<C: RpcClient> {
    subscribers: Option<Owned<Vec<C>>>,
}

impl<C: RpcClient> Default for SubscriberSet<C> {
    fn default() -> Self {
        SubscriberSet { subscribers: None }
    }
}

impl<C: RpcClient> SubscriberSet<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the peer behind `ctx`. Adding the same peer twice is a no-op.
    pub fn add<R: Default>(&mut self, ctx: &RpcContext) -> R {
        let subscribers = self.subscribers.get_or_insert_with(Owned::default);
        subscribers.with_mut(|subscribers| {
            if !subscribers
                .iter()
                .any(|s| same_endpoint(s.endpoint(), &ctx.endpoint))
            {
                debug!(uri = ctx.endpoint.uri(), service = C::service_name(), "subscriber added");
                subscribers.push(C::from_endpoint(ctx.endpoint.clone()));
            }
        });
        R::default()
    }

    /// Unsubscribes the peer behind `ctx`, reporting an error in the response if it was not
    /// subscribed.
    pub fn remove<R: SubscriberResponse + Default>(&mut self, ctx: &RpcContext) -> R {
        let removed = self.subscribers.as_ref().is_some_and(|subscribers| {
            subscribers.with_mut(|subscribers| {
                let len = subscribers.len();
                subscribers.retain(|s| !same_endpoint(s.endpoint(), &ctx.endpoint));
                subscribers.len() != len
            })
        });
        if removed {
            return R::default();
        }
        R::disconnection_error(RpcDisconnectionError {
            target_service: C::service_name().to_string(),
            target_uri: ctx.endpoint.uri().to_string(),
            details: "could not find corresponding subscriber".to_string(),
        })
    }

    /// Calls `invocable` on every subscriber concurrently, giving each call `timeout` to finish.
    ///
    /// Subscribers that turn out to be disconnected are dropped from the set; other failures are
    /// logged. The returned future does not borrow the set.
    pub fn notify_subscribers<T, F, Fut>(
        &self,
        invocable: F,
        timeout: Duration,
    ) -> impl Future<Output = ()> + use<C, T, F, Fut>
    where
        F: Fn(&C) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let (registry, subscribers) = match &self.subscribers {
            Some(owned) => (Some(owned.borrow()), owned.with(|s| s.clone())),
            None => (None, Vec::new()),
        };
        let notifications = subscribers.into_iter().map(|subscriber| {
            let registry = registry.clone();
            let endpoint = subscriber.endpoint().clone();
            invocable(&subscriber)
                .map(drop)
                .with_timeout(timeout)
                .catch(move |err| {
                    if err.is_disconnected() {
                        debug!(uri = endpoint.uri(), "dropping disconnected subscriber");
                        if let Some(registry) = registry.filter(Borrowed::is_alive) {
                            registry.with_mut(|subscribers| {
                                subscribers.retain(|s| !same_endpoint(s.endpoint(), &endpoint))
                            });
                        }
                    } else {
                        warn!(
                            subscriber = C::service_name(),
                            uri = endpoint.uri(),
                            %err,
                            "failed to notify subscriber"
                        );
                    }
                    ready(Ok::<(), Error>(()))
                })
        });
        let notifications = join_all(notifications.collect::<Vec<_>>());
        async move {
            notifications.await;
        }
    }

    /// [`notify_subscribers`](Self::notify_subscribers) with [`DEFAULT_NOTIFY_TIMEOUT`].
    pub fn notify<T, F, Fut>(&self, invocable: F) -> impl Future<Output = ()> + use<C, T, F, Fut>
    where
        F: Fn(&C) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.notify_subscribers(invocable, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_subscribers<R>(&self, f: impl FnOnce(&[C]) -> R) -> R {
        match &self.subscribers {
            Some(subscribers) => subscribers.with(|s| f(s)),
            None => f(&[]),
        }
    }

    pub fn len(&self) -> usize {
        self.with_subscribers(|s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: RpcClient> fmt::Debug for SubscriberSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("service", &C::SERVICE_FULL_NAME)
            .field("len", &self.len())
            .finish()
    }
}
