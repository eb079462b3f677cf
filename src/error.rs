use thiserror::Error;

use crate::protocol::StreamId;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("No authtoken configured")]
    MissingAuthtoken,

    #[error("Relay error: {code} - {message}")]
    Relay { code: String, message: String },

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid server address: {0}")]
    InvalidServerUrl(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Session is not connected to the relay")]
    NotConnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Stream {0} closed")]
    StreamClosed(StreamId),

    #[error("Stream {0} already open")]
    DuplicateStream(StreamId),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, SluiceError>;
