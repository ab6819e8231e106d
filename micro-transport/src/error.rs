use micro_core::MicroError;

/// Tagged I/O failure raised by transports.
pub enum TransportError {
    ConnectionRefused(String),
    ConnectionReset(String),
    Timeout(String),
    NotConnected,
    InvalidMessage(String),
    Internal(String),
}

impl TransportError {
    /// Stable tag, used in logs and metrics labels.
    pub fn tag(&self) -> &'static str {
        match self {
            TransportError::ConnectionRefused(_) => "connection_refused",
            TransportError::ConnectionReset(_) => "connection_reset",
            TransportError::Timeout(_) => "timeout",
            TransportError::NotConnected => "not_connected",
            TransportError::InvalidMessage(_) => "invalid_message",
            TransportError::Internal(_) => "internal",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionRefused(msg) => write!(f, "connection refused: {msg}"),
            TransportError::ConnectionReset(msg) => write!(f, "connection reset: {msg}"),
            TransportError::Timeout(msg) => write!(f, "timed out: {msg}"),
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            TransportError::Internal(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::fmt::Debug for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(err.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                TransportError::ConnectionReset(err.to_string())
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout(err.to_string()),
            ErrorKind::NotConnected => TransportError::NotConnected,
            _ => TransportError::Internal(err.to_string()),
        }
    }
}

/// Transport failures surface as `ServiceUnavailable` at the client boundary
/// unless they are timeouts.
impl From<TransportError> for MicroError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => MicroError::Timeout(msg),
            other => MicroError::ServiceUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope").into();
        assert_eq!(err.tag(), "connection_refused");

        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.tag(), "connection_reset");
    }

    #[test]
    fn timeouts_map_to_504_everything_else_503() {
        let err: MicroError = TransportError::Timeout("slow".into()).into();
        assert_eq!(err.status(), 504);
        let err: MicroError = TransportError::ConnectionReset("gone".into()).into();
        assert_eq!(err.status(), 503);
    }
}
