use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::Error;

/// `method_id` of responses to previously sent requests.
pub const RESPONSE_METHOD_ID: u32 = 0;

/// `request_id` of requests that expect no response.
pub const ONE_WAY_REQUEST_ID: u32 = 0;

pub const TWO_WAY_REQUEST_ID_MIN: u32 = 1;
pub const TWO_WAY_REQUEST_ID_MAX: u32 = u32::MAX;

/// Anything that can travel as an envelope payload.
///
/// Implemented for every serde type through `postcard`.
pub trait Message: Sized {
    fn to_bytes(&self) -> Result<Vec<u8>, Error>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error>;
}

impl<T: Serialize + DeserializeOwned> Message for T {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        postcard::to_allocvec(self).map_err(|err| Error::Handler(err.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        postcard::from_bytes(bytes).map_err(|err| Error::invalid_data(bytes, err))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Version {
    #[default]
    Unspecified = 0,
    One = 1,
}

/// The envelope exchanged between two endpoints.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub version: Version,
    pub service_id: u16,
    /// [`RESPONSE_METHOD_ID`] for responses.
    pub method_id: u32,
    /// [`ONE_WAY_REQUEST_ID`] for requests that expect no response.
    pub request_id: u32,
    pub message_bytes: Vec<u8>,
    /// Set by a handler that could not produce a normal response.
    pub error: Option<String>,
    /// Marks a cancellation notice for the two-way request `request_id`.
    pub cancel: bool,
}

impl RpcMessage {
    /// A request envelope; the endpoint fills in `request_id` when sending.
    pub fn request(service_id: u16, method_id: u32, message_bytes: Vec<u8>) -> Self {
        RpcMessage {
            version: Version::One,
            service_id,
            method_id,
            message_bytes,
            ..Default::default()
        }
    }

    pub fn response(service_id: u16, request_id: u32, message_bytes: Vec<u8>) -> Self {
        RpcMessage {
            version: Version::One,
            service_id,
            method_id: RESPONSE_METHOD_ID,
            request_id,
            message_bytes,
            ..Default::default()
        }
    }

    pub fn error_response(service_id: u16, request_id: u32, error: impl Into<String>) -> Self {
        RpcMessage {
            error: Some(error.into()),
            ..RpcMessage::response(service_id, request_id, Vec::new())
        }
    }

    pub fn cancellation(service_id: u16, request_id: u32) -> Self {
        RpcMessage {
            version: Version::One,
            service_id,
            request_id,
            cancel: true,
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.method_id == RESPONSE_METHOD_ID
    }

    pub fn is_one_way(&self) -> bool {
        self.request_id == ONE_WAY_REQUEST_ID
    }

    /// Whether every field still holds its default value.
    pub fn is_empty(&self) -> bool {
        *self == RpcMessage::default()
    }

    /// Decodes the payload as `M`.
    pub fn parse<M: Message>(&self) -> Result<M, Error> {
        M::from_bytes(&self.message_bytes)
    }
}
