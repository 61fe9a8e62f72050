use horus_runtime::future::Elapsed;

/// Bytes of an invalid payload echoed back in [`Error::InvalidData`].
const INVALID_DATA_PREVIEW: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "miette", derive(miette::Diagnostic))]
pub enum Error {
    #[error("rpc endpoint disconnected")]
    #[cfg_attr(
        feature = "miette",
        diagnostic(
            code(horus::rpc::disconnected),
            help("the endpoint was not connected, or every retry attempt failed")
        )
    )]
    Disconnected,

    #[error("invalid message data: {details}")]
    #[cfg_attr(
        feature = "miette",
        diagnostic(
            code(horus::rpc::invalid_data),
            help("this usually means both sides disagree on the protocol version")
        )
    )]
    InvalidData { details: String },

    #[error("unknown method {method_id} for service {service_id}")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::unknown_method)))]
    UnknownMethod { service_id: u16, method_id: u32 },

    #[error("no handler found for service {service_id}")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::unknown_service)))]
    UnknownService { service_id: u16 },

    #[error("rpc timed out")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::timeout)))]
    Timeout,

    #[error("handler failed: {0}")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::handler)))]
    Handler(String),

    #[error("remote error: {0}")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::remote)))]
    Remote(String),

    #[error("rpc endpoint shut down")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::shutdown)))]
    Shutdown,

    #[error("transport error: {0}")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::transport)))]
    Transport(String),

    #[error("invalid request id {request_id} received")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::rpc::invalid_request_id)))]
    InvalidRequestId { request_id: u32 },
}

impl Error {
    /// Builds [`Error::InvalidData`] quoting (a prefix of) the offending bytes.
    pub fn invalid_data(bytes: &[u8], cause: impl std::fmt::Display) -> Self {
        let preview = &bytes[..bytes.len().min(INVALID_DATA_PREVIEW)];
        let ellipsis = if bytes.len() > INVALID_DATA_PREVIEW { "..." } else { "" };
        Error::InvalidData {
            details: format!("{cause}: \"{}{ellipsis}\"", preview.escape_ascii()),
        }
    }

    /// Whether this error means the peer is gone, as opposed to a failure of one request.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Shutdown)
    }
}

impl From<Elapsed> for Error {
    fn from(_: Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<horus_runtime::Error> for Error {
    fn from(err: horus_runtime::Error) -> Self {
        match err {
            horus_runtime::Error::Elapsed(_) => Error::Timeout,
            horus_runtime::Error::Shutdown => Error::Shutdown,
            err => Error::Handler(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_data_escapes_payload() {
        let err = Error::invalid_data(b"ok\n\"\xff", "bad envelope");
        assert_eq!(
            err,
            Error::InvalidData {
                details: r#"bad envelope: "ok\n\"\xff""#.to_string()
            }
        );
    }

    #[test]
    fn test_invalid_data_truncates_long_payloads() {
        let err = Error::invalid_data(&[b'a'; 100], "bad");
        let Error::InvalidData { details } = err else {
            panic!("wrong variant");
        };
        assert!(details.ends_with("...\""));
        assert_eq!(details.matches('a').count(), INVALID_DATA_PREVIEW + 1);
    }

    #[test]
    fn test_disconnection_kinds() {
        assert!(Error::Disconnected.is_disconnected());
        assert!(Error::Shutdown.is_disconnected());
        assert!(!Error::Timeout.is_disconnected());
        assert_eq!(Error::from(Elapsed), Error::Timeout);
    }
}
