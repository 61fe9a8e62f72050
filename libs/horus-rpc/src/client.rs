use std::{future::ready, rc::Rc};

use horus_runtime::{AnyFuture, TryFutureExt};

use crate::{Error, Message, RpcEndpoint, RpcMessage, RpcOptions};

/// The last segment of a dotted service name, e.g. `Robot` for `horus.sdk.Robot`.
pub fn service_name(full_name: &str) -> &str {
    full_name
        .rsplit_once('.')
        .map_or(full_name, |(_, name)| name)
}

/// A typed client for one service, talking through an [`RpcEndpoint`].
///
/// Generated service clients implement the two constructors and call [`invoke`] or
/// [`invoke_one_way`] from their methods.
///
/// [`invoke`]: RpcClient::invoke
/// [`invoke_one_way`]: RpcClient::invoke_one_way
pub trait RpcClient: Clone + 'static {
    const SERVICE_ID: u16;
    const SERVICE_FULL_NAME: &'static str;

    fn from_endpoint(endpoint: Rc<dyn RpcEndpoint>) -> Self;

    fn endpoint(&self) -> &Rc<dyn RpcEndpoint>;

    fn service_name() -> &'static str {
        service_name(Self::SERVICE_FULL_NAME)
    }

    fn request_message<Req: Message>(method_id: u32, request: &Req) -> Result<RpcMessage, Error> {
        Ok(RpcMessage::request(
            Self::SERVICE_ID,
            method_id,
            request.to_bytes()?,
        ))
    }

    /// Sends a two-way request and decodes its response.
    fn invoke<Req, Resp>(
        &self,
        method_id: u32,
        request: &Req,
        options: &RpcOptions,
    ) -> AnyFuture<Result<Resp, Error>>
    where
        Req: Message,
        Resp: Message + 'static,
    {
        let message = match Self::request_message(method_id, request) {
            Ok(message) => message,
            Err(err) => return AnyFuture::ready(Err(err)),
        };
        let response = self.endpoint().send_with_response(message, options);
        AnyFuture::new(response.then(|response| ready(response.parse::<Resp>())))
    }

    fn invoke_one_way<Req: Message>(
        &self,
        method_id: u32,
        request: &Req,
        options: &RpcOptions,
    ) -> AnyFuture<Result<(), Error>> {
        match Self::request_message(method_id, request) {
            Ok(message) => self.endpoint().send(message, options),
            Err(err) => AnyFuture::ready(Err(err)),
        }
    }
}
