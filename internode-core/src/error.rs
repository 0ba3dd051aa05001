//! The error taxonomy shared by the messaging service and its transport.

use crate::codec::CodecError;

/// Errors surfaced by sends, handlers and transport operations.
///
/// The send pipeline keys its policy off these variants: every failure
/// counts as a dropped message for its verb; only [`RpcError::Closed`]
/// additionally evicts the client from the connection pool, and only
/// [`RpcError::Closed`] is retried by the streaming retry wrapper.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The connection was lost, the peer reset it, or the local service is
    /// shutting down.
    #[error("connection closed")]
    Closed,

    /// The per-call deadline elapsed before a reply arrived.
    #[error("rpc timed out")]
    Timeout,

    /// The remote handler failed; the peer reported the error verbatim.
    #[error("remote handler error: {message}")]
    Remote {
        /// Error description reported by the peer.
        message: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("codec error: {message}")]
    Codec {
        /// Details of the codec failure.
        message: String,
    },

    /// A local I/O operation failed (bind, TLS setup, socket options).
    #[error("i/o error: {message}")]
    Io {
        /// Details of the I/O failure.
        message: String,
    },
}

impl RpcError {
    /// Whether this error indicates the transport is unusable.
    ///
    /// Transport errors evict the client from its pool slot; other errors
    /// leave the connection cached.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Closed)
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
        }
    }
}

/// Result type for messaging operations.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_closed_is_transport() {
        assert!(RpcError::Closed.is_transport());
        assert!(!RpcError::Timeout.is_transport());
        assert!(
            !RpcError::Remote {
                message: "boom".into()
            }
            .is_transport()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RpcError::Closed.to_string(), "connection closed");
        assert_eq!(RpcError::Timeout.to_string(), "rpc timed out");
        let remote = RpcError::Remote {
            message: "division by zero".into(),
        };
        assert!(remote.to_string().contains("division by zero"));
    }

    #[test]
    fn test_from_io_error() {
        let err: RpcError = std::io::Error::other("bind failed").into();
        assert!(matches!(err, RpcError::Io { .. }));
    }
}
