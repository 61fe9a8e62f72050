use std::{
    future::{Future, ready},
    rc::Rc,
};

use horus_runtime::{AnyFuture, TryFutureExt, function::MoveOnlyFn};
use tracing::trace;

use crate::{Error, Message, MessageHandler, RpcContext, RpcMessage, Version, client};

/// The server side of one service.
///
/// Implementations match on `request.method_id` and forward to [`dispatch`] or
/// [`dispatch_one_way`], falling back to [`unknown_method`].
pub trait RpcHandler: 'static {
    const SERVICE_ID: u16;
    const SERVICE_FULL_NAME: &'static str;

    fn service_name() -> &'static str {
        client::service_name(Self::SERVICE_FULL_NAME)
    }

    fn handle(&self, ctx: RpcContext, request: RpcMessage) -> AnyFuture<Result<RpcMessage, Error>>;
}

/// Object-safe view of an [`RpcHandler`], as stored by [`client_handler`].
pub trait ServiceHandler {
    fn service_id(&self) -> u16;
    fn service_full_name(&self) -> &'static str;
    fn handle(&self, ctx: RpcContext, request: RpcMessage) -> AnyFuture<Result<RpcMessage, Error>>;
}

impl<H: RpcHandler> ServiceHandler for H {
    fn service_id(&self) -> u16 {
        H::SERVICE_ID
    }

    fn service_full_name(&self) -> &'static str {
        H::SERVICE_FULL_NAME
    }

    fn handle(&self, ctx: RpcContext, request: RpcMessage) -> AnyFuture<Result<RpcMessage, Error>> {
        RpcHandler::handle(self, ctx, request)
    }
}

/// Decodes a two-way request, runs `method` and encodes its result as the response.
pub fn dispatch<Req, Resp, Fut>(
    request: &RpcMessage,
    method: impl FnOnce(Req) -> Fut,
) -> AnyFuture<Result<RpcMessage, Error>>
where
    Req: Message,
    Resp: Message + 'static,
    Fut: Future<Output = Result<Resp, Error>> + 'static,
{
    let (service_id, request_id) = (request.service_id, request.request_id);
    let decoded = match request.parse::<Req>() {
        Ok(decoded) => decoded,
        Err(err) => return AnyFuture::ready(Err(err)),
    };
    AnyFuture::new(method(decoded).then(move |response: Resp| {
        ready(response.to_bytes().map(|bytes| RpcMessage {
            version: Version::One,
            ..RpcMessage::response(service_id, request_id, bytes)
        }))
    }))
}

/// Like [`dispatch`] for one-way methods, resolving to an empty message.
pub fn dispatch_one_way<Req, Fut>(
    request: &RpcMessage,
    method: impl FnOnce(Req) -> Fut,
) -> AnyFuture<Result<RpcMessage, Error>>
where
    Req: Message,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    let decoded = match request.parse::<Req>() {
        Ok(decoded) => decoded,
        Err(err) => return AnyFuture::ready(Err(err)),
    };
    AnyFuture::new(method(decoded).map(|()| RpcMessage::default()))
}

pub fn unknown_method(request: &RpcMessage) -> AnyFuture<Result<RpcMessage, Error>> {
    AnyFuture::ready(Err(Error::UnknownMethod {
        service_id: request.service_id,
        method_id: request.method_id,
    }))
}

/// Routes received requests to `handlers` by `service_id`.
///
/// A one-way request for an unknown method or service is dropped. A two-way one fails, so that
/// the caller gets an error response instead of waiting forever.
pub fn client_handler(handlers: Vec<Rc<dyn ServiceHandler>>) -> MessageHandler {
    MoveOnlyFn::new(move |(ctx, request): (RpcContext, RpcMessage)| {
        let one_way = request.is_one_way();
        let service_id = request.service_id;
        let Some(handler) = handlers.iter().find(|h| h.service_id() == service_id) else {
            if one_way {
                trace!(service_id, "one-way request for unknown service");
                return AnyFuture::ready(Ok(RpcMessage::default()));
            }
            return AnyFuture::ready(Err(Error::UnknownService { service_id }));
        };
        let response = handler.handle(ctx, request);
        if !one_way {
            return response;
        }
        AnyFuture::new(response.catch(|err| async move {
            match err {
                Error::UnknownMethod {
                    service_id,
                    method_id,
                } => {
                    trace!(service_id, method_id, "one-way request for unknown method");
                    Ok(RpcMessage::default())
                }
                err => Err(err),
            }
        }))
    })
}

/// A handler that answers every two-way request with [`Error::UnknownService`].
pub fn no_message_handler() -> MessageHandler {
    client_handler(Vec::new())
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{RpcEndpoint, connection::Connection, transport::MemoryTransport};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    struct Counter;

    impl RpcHandler for Counter {
        const SERVICE_ID: u16 = 7;
        const SERVICE_FULL_NAME: &'static str = "horus.test.Counter";

        fn handle(
            &self,
            _ctx: RpcContext,
            request: RpcMessage,
        ) -> AnyFuture<Result<RpcMessage, Error>> {
            match request.method_id {
                1 => dispatch(&request, |Ping(n)| async move { Ok(Ping(n + 1)) }),
                2 => dispatch_one_way(&request, |Ping(_)| async { Ok(()) }),
                _ => unknown_method(&request),
            }
        }
    }

    fn context() -> RpcContext {
        let (a, _b) = MemoryTransport::pair();
        let endpoint: Rc<dyn RpcEndpoint> =
            Connection::open(a, no_message_handler(), Default::default());
        RpcContext::new(endpoint)
    }

    async fn call(handler: &mut MessageHandler, request: RpcMessage) -> Result<RpcMessage, Error> {
        handler.call((context(), request)).await
    }

    fn counter() -> Vec<Rc<dyn ServiceHandler>> {
        vec![Rc::new(Counter)]
    }

    #[horus_runtime::test]
    async fn test_dispatch_encodes_response() {
        let mut handler = client_handler(counter());
        let mut request = RpcMessage::request(7, 1, Ping(41).to_bytes().unwrap());
        request.request_id = 3;
        let response = call(&mut handler, request).await.unwrap();
        assert_eq!(response.version, Version::One);
        assert_eq!(response.request_id, 3);
        assert!(response.is_response());
        assert_eq!(response.parse::<Ping>().unwrap(), Ping(42));
        assert_eq!(Counter::service_name(), "Counter");
    }

    #[horus_runtime::test]
    async fn test_unknown_method_asymmetry() {
        let mut handler = client_handler(counter());
        let one_way = RpcMessage::request(7, 99, vec![]);
        assert_eq!(call(&mut handler, one_way).await, Ok(RpcMessage::default()));

        let mut two_way = RpcMessage::request(7, 99, vec![]);
        two_way.request_id = 1;
        assert_eq!(
            call(&mut handler, two_way).await,
            Err(Error::UnknownMethod {
                service_id: 7,
                method_id: 99
            })
        );
    }

    #[horus_runtime::test]
    async fn test_unknown_service() {
        let mut handler = no_message_handler();
        let one_way = RpcMessage::request(3, 1, vec![]);
        assert!(call(&mut handler, one_way).await.is_ok());

        let mut two_way = RpcMessage::request(3, 1, vec![]);
        two_way.request_id = 1;
        assert_eq!(
            call(&mut handler, two_way).await,
            Err(Error::UnknownService { service_id: 3 })
        );
    }

    #[horus_runtime::test]
    async fn test_invalid_payload_is_reported() {
        let mut handler = client_handler(counter());
        let mut request = RpcMessage::request(7, 1, vec![]);
        request.request_id = 1;
        assert!(matches!(
            call(&mut handler, request).await,
            Err(Error::InvalidData { .. })
        ));
    }
}
