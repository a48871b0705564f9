use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced anywhere in the gateway: codec, channels, tunnels, sessions.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("tunnel establish error: {0}")]
    TunnelEstablish(String),

    #[error("tunnel invalidated: {0}")]
    TunnelInvalidated(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("session terminated")]
    SessionTerminated,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Wire-visible error classification carried in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedMessage,
    DecodeError,
    UnknownType,
    ChannelClosed,
    TunnelEstablishError,
    TunnelInvalidated,
    RequestTimeout,
    SessionTerminated,
    SessionNotFound,
    HandshakeRejected,
    UnsupportedOperation,
    RemoteError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedMessage => "MalformedMessage",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::UnknownType => "UnknownType",
            ErrorKind::ChannelClosed => "ChannelClosed",
            ErrorKind::TunnelEstablishError => "TunnelEstablishError",
            ErrorKind::TunnelInvalidated => "TunnelInvalidated",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::SessionTerminated => "SessionTerminated",
            ErrorKind::SessionNotFound => "SessionNotFound",
            ErrorKind::HandshakeRejected => "HandshakeRejected",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::RemoteError => "RemoteError",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    /// Classify this error for the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            GatewayError::Decode(_) => ErrorKind::DecodeError,
            GatewayError::UnknownType(_) => ErrorKind::UnknownType,
            GatewayError::ChannelClosed => ErrorKind::ChannelClosed,
            GatewayError::TunnelEstablish(_) => ErrorKind::TunnelEstablishError,
            GatewayError::TunnelInvalidated(_) => ErrorKind::TunnelInvalidated,
            GatewayError::RequestTimeout => ErrorKind::RequestTimeout,
            GatewayError::SessionTerminated => ErrorKind::SessionTerminated,
            GatewayError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            GatewayError::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            GatewayError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            GatewayError::Remote { .. } => ErrorKind::RemoteError,
            GatewayError::Config(_)
            | GatewayError::Transport(_)
            | GatewayError::Io(_)
            | GatewayError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Protocol errors reject a single envelope and never affect the session.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            GatewayError::MalformedMessage(_)
                | GatewayError::Decode(_)
                | GatewayError::UnknownType(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_as_their_names() {
        let json = serde_json::to_string(&ErrorKind::TunnelEstablishError).unwrap();
        assert_eq!(json, "\"TunnelEstablishError\"");
        assert_eq!(ErrorKind::RequestTimeout.to_string(), "RequestTimeout");
    }

    #[test]
    fn internal_errors_collapse_to_internal_kind() {
        let io = GatewayError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), ErrorKind::Internal);
        assert_eq!(GatewayError::Config("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn protocol_errors_are_flagged() {
        assert!(GatewayError::UnknownType("blob".into()).is_protocol());
        assert!(!GatewayError::ChannelClosed.is_protocol());
    }
}
