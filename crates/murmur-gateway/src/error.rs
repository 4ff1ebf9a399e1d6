//! Error types for the shard client.

/// Errors surfaced by a [`Shard`](crate::Shard).
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The gateway closed the connection with a non-recoverable code.
    ///
    /// The shard goes `Offline` and does not reconnect on its own.
    #[error("fatal gateway close {code}: {reason}")]
    Fatal {
        /// Close code reported by the gateway.
        code: u16,
        /// Close reason, if the gateway supplied one.
        reason: String,
    },

    /// A command requires an intent the shard was not configured with.
    #[error("missing intent: {0}")]
    MissingIntent(&'static str),

    /// `WebSocket` transport error.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// Transport-level failure reported through the event stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The shard shut down while the operation was waiting.
    #[error("shard shut down")]
    Shutdown,
}

impl From<tokio_tungstenite::tungstenite::Error> for ShardError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
