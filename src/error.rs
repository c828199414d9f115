//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("client credentials not configured (set WHOOP_CLIENT_ID and WHOOP_CLIENT_SECRET)")]
    MissingClientCredentials,

    #[error("authorization timed out after {0}s waiting for browser callback")]
    AuthorizationTimeout(u64),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("{method} {path} failed after {attempts} attempts")]
    RequestFailed {
        method: String,
        path: String,
        attempts: u32,
    },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
