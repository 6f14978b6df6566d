//! Error types for the teamlink client.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),

    #[error("Handshake: {0}")]
    Handshake(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("peer selection requires team mode")]
    NotTeamMode,

    #[error("connection manager has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
