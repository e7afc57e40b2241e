//! Backend error types.

use objsync_protocol::ValueKind;
use thiserror::Error;

/// Errors raised by the owning side of a connection.
#[derive(Debug, Error)]
pub enum BackendError {
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

    #[error("cannot register {0} after the connection has started")]
    AlreadyStarted(String),

    #[error("connection has not been started")]
    NotStarted,

    #[error("too many instantiable types (max {max}), cannot register {name}")]
    TooManyTypes { name: String, max: usize },

    #[error("type {0} is already registered")]
    DuplicateType(String),

    #[error("singleton {0} is already registered")]
    DuplicateSingleton(String),

    #[error("invalid singleton name {0:?}: must begin with an uppercase letter")]
    InvalidSingletonName(String),

    #[error("object {0} is active on a different connection")]
    ForeignObject(String),

    #[error("{command} for unknown object {identifier}")]
    UnknownObject {
        command: &'static str,
        identifier: String,
    },

    #[error("object {identifier} already exists")]
    DuplicateIdentifier { identifier: String },

    #[error("no instantiable type named {0}")]
    UnknownType(String),

    #[error("method {method} does not exist on type {type_name}")]
    UnknownMethod { type_name: String, method: String },

    #[error("signal {signal} does not exist on type {type_name}")]
    UnknownSignal { type_name: String, signal: String },

    #[error("signal {signal} takes {expected} arguments, got {actual}")]
    SignalArity {
        signal: String,
        expected: usize,
        actual: usize,
    },

    #[error("sync serial mismatch: expected {expected:?}, got {actual}")]
    SyncSerialMismatch { expected: Option<u64>, actual: u64 },

    #[error("unexpected command {0} from the consuming side")]
    UnexpectedCommand(&'static str),
}

impl BackendError {
    /// Returns whether this error terminates the connection.
    ///
    /// Registration and emission mistakes are application bugs reported to
    /// the caller; everything that means the two sides disagree is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackendError::AlreadyStarted(_)
                | BackendError::NotStarted
                | BackendError::TooManyTypes { .. }
                | BackendError::DuplicateType(_)
                | BackendError::DuplicateSingleton(_)
                | BackendError::InvalidSingletonName(_)
                | BackendError::ForeignObject(_)
                | BackendError::UnknownSignal { .. }
                | BackendError::SignalArity { .. }
        )
    }
}

/// Failure of a single method call.
///
/// Never fatal: the message is carried back in the `error` field of
/// INVOKE_RETURN.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MethodError {
    #[error("{method} expects {expected} arguments, got {actual}")]
    WrongArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} should be {expected}, got {found}")]
    WrongArgumentType {
        index: usize,
        expected: ValueKind,
        found: &'static str,
    },

    #[error("method {0} is declared but not implemented")]
    NotImplemented(String),

    #[error("{0}")]
    Failed(String),
}

impl MethodError {
    pub fn failed(message: impl Into<String>) -> Self {
        MethodError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BackendError::ConnectionClosed.is_fatal());
        assert!(BackendError::SyncSerialMismatch {
            expected: Some(1),
            actual: 2
        }
        .is_fatal());
        assert!(BackendError::UnknownObject {
            command: "OBJECT_QUERY",
            identifier: "x".into()
        }
        .is_fatal());
        assert!(!BackendError::DuplicateType("Item".into()).is_fatal());
        assert!(!BackendError::UnknownSignal {
            type_name: "Root".into(),
            signal: "nope".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_method_error_display() {
        let err = MethodError::WrongArgumentCount {
            method: "addOne".into(),
            expected: 0,
            actual: 2,
        };
        assert_eq!(err.to_string(), "addOne expects 0 arguments, got 2");

        let err = MethodError::WrongArgumentType {
            index: 1,
            expected: ValueKind::Int,
            found: "string",
        };
        assert_eq!(err.to_string(), "argument 1 should be int, got string");

        assert_eq!(MethodError::failed("boom").to_string(), "boom");
    }
}
