//! Error taxonomy for the transport stack.
//!
//! Every failure a caller can observe maps onto one of the variants below.
//! The distinction matters operationally: `Io` and `Inactivity` failures are
//! recovered internally by the failover layer and only surface once
//! reconnection is terminally exhausted, while `Closed`, `Timeout`, and
//! `Configuration` errors always surface immediately to the caller.

use thiserror::Error;

/// Errors produced by the transport stack.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A physical connection failed (socket error, EOF, reset).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The WireFormatInfo exchange failed or produced unusable parameters.
    #[error("wire format negotiation failed: {0}")]
    Negotiation(String),

    /// A bounded wait elapsed before the operation could complete.
    #[error("{0}")]
    Timeout(String),

    /// The peer reported inactivity or the read-check window expired.
    #[error("channel was inactive for too long: {0}")]
    Inactivity(String),

    /// The broker answered a tracked request with an ExceptionResponse.
    #[error("broker exception [{class}]: {message}")]
    Protocol { class: String, message: String },

    /// Invalid or unknown configuration supplied at construction time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Operation attempted on a transport that has been closed.
    #[error("transport disposed: {0}")]
    Closed(String),

    /// Reconnection attempts were exhausted for every candidate URI.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("wire codec error: {0}")]
    Codec(String),

    /// The operation is not available on this transport layer.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// True when the failure is tied to a single physical connection and the
    /// failover layer may recover by reconnecting elsewhere.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Inactivity(_)
                | TransportError::Negotiation(_)
                | TransportError::Codec(_)
        )
    }

    /// Clone-ish helper: errors are not `Clone` because of the wrapped
    /// `std::io::Error`, but the failover layer needs to latch a failure and
    /// hand copies to multiple waiters.
    pub fn duplicate(&self) -> TransportError {
        match self {
            TransportError::Io(e) => {
                TransportError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
            TransportError::Negotiation(s) => TransportError::Negotiation(s.clone()),
            TransportError::Timeout(s) => TransportError::Timeout(s.clone()),
            TransportError::Inactivity(s) => TransportError::Inactivity(s.clone()),
            TransportError::Protocol { class, message } => TransportError::Protocol {
                class: class.clone(),
                message: message.clone(),
            },
            TransportError::Configuration(s) => TransportError::Configuration(s.clone()),
            TransportError::Closed(s) => TransportError::Closed(s.clone()),
            TransportError::ConnectionFailed(s) => TransportError::ConnectionFailed(s.clone()),
            TransportError::Codec(s) => TransportError::Codec(s.clone()),
            TransportError::Unsupported(s) => TransportError::Unsupported(s.clone()),
        }
    }

    pub(crate) fn closed() -> TransportError {
        TransportError::Closed("transport disposed".to_string())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let io = TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_recoverable());
        assert!(!TransportError::closed().is_recoverable());
        assert!(!TransportError::Timeout("send".into()).is_recoverable());
        assert!(!TransportError::Protocol {
            class: "javax.jms.JMSException".into(),
            message: "boom".into()
        }
        .is_recoverable());
    }

    #[test]
    fn duplicate_preserves_io_kind() {
        let io = TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        ));
        match io.duplicate() {
            TransportError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected variant: {other}"),
        }
    }
}
