//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

/// Errors raised by the protocol client, the stream decoder and the session loop.
///
/// None of these cross the control surface: the controller logs them and
/// reports success or failure as a boolean.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Transport unreachable, closed, or failed mid-conversation.
    #[error("connection error: {0}")]
    Connection(String),
    /// Malformed or unsuccessful command result.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The external decoding process could not be started.
    #[error("decoder unavailable: {0}")]
    DecoderUnavailable(String),
    /// Any other failure while a session is ingesting.
    #[error("session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Session(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Protocol(err.to_string())
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Session(format!("{:#}", err))
    }
}
