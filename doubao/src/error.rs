//! Error types for the Doubao realtime dialogue client.

use thiserror::Error;

/// Result type alias for Doubao dialogue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Doubao dialogue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure reported by the dialogue service in an error frame.
    #[error("doubao: {message} (code={code})")]
    Upstream { code: u32, message: String },

    /// Timed out waiting for a handshake event (50 or 150).
    #[error("timeout waiting for event {0}")]
    HandshakeTimeout(i32),

    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    Closed,

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
