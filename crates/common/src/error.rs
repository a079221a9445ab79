use thiserror::Error;

use crate::protocol::RelayError;

/// Error types for the tunnel transport and wire protocol
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout waiting for connection_ack")]
    HandshakeTimeout,

    #[error("No keep-alive received within {0}ms")]
    KeepAliveTimeout(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("{operation} rejected by relay: {}", summarize(.errors))]
    OperationRejected {
        operation: &'static str,
        errors: Vec<RelayError>,
    },

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

impl TunnelError {
    /// Transport-level errors end the connection; the supervisor reconnects
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionError(_)
                | TunnelError::HandshakeTimeout
                | TunnelError::KeepAliveTimeout(_)
                | TunnelError::ConnectionClosed
                | TunnelError::Signing(_)
                | TunnelError::WebSocketError(_)
        )
    }
}

fn summarize(errors: &[RelayError]) -> String {
    if errors.is_empty() {
        return "no details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{}: {}", e.error_type, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;
