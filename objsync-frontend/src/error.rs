//! Frontend error types.

use thiserror::Error;

/// Errors raised by the consuming side of a connection.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] objsync_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected command {0} from the owning side")]
    UnexpectedCommand(&'static str),

    #[error("connection is not ready")]
    NotReady,

    #[error("no singleton named {0}")]
    UnknownSingleton(String),

    #[error("no instantiable type named {0}")]
    UnknownType(String),

    #[error("property {property} does not exist on type {type_name}")]
    UnknownProperty { type_name: String, property: String },

    #[error("property {property} of type {type_name} is read-only")]
    ReadOnlyProperty { type_name: String, property: String },

    #[error("method {method} does not exist on type {type_name}")]
    UnknownMethod { type_name: String, method: String },

    #[error("signal {signal} does not exist on type {type_name}")]
    UnknownSignal { type_name: String, signal: String },

    #[error("{method} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl FrontendError {
    /// Returns whether this error terminates the connection.
    ///
    /// Local checks against type descriptors and failed method calls leave
    /// the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FrontendError::NotReady
                | FrontendError::UnknownSingleton(_)
                | FrontendError::UnknownType(_)
                | FrontendError::UnknownProperty { .. }
                | FrontendError::ReadOnlyProperty { .. }
                | FrontendError::UnknownMethod { .. }
                | FrontendError::UnknownSignal { .. }
                | FrontendError::ArgumentCount { .. }
                | FrontendError::Invoke(_)
        )
    }
}

/// Why an invocation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// The method reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The connection ended before the result arrived.
    #[error("invocation cancelled: {0}")]
    Cancelled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FrontendError::ConnectionClosed.is_fatal());
        assert!(FrontendError::Timeout("object_reset").is_fatal());
        assert!(FrontendError::UnexpectedCommand("INVOKE").is_fatal());
        assert!(FrontendError::Protocol(objsync_protocol::ProtocolError::ZeroLength).is_fatal());

        assert!(!FrontendError::NotReady.is_fatal());
        assert!(!FrontendError::UnknownMethod {
            type_name: "Root".into(),
            method: "nope".into()
        }
        .is_fatal());
        assert!(!FrontendError::from(InvokeError::Remote("boom".into())).is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = FrontendError::ArgumentCount {
            method: "add".into(),
            expected: 1,
            actual: 3,
        };
        assert_eq!(err.to_string(), "add expects 1 arguments, got 3");
        assert_eq!(
            FrontendError::from(InvokeError::Remote("boom".into())).to_string(),
            "remote error: boom"
        );
    }
}
