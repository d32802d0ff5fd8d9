use identity_core::CoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Per-request failures. None of these are fatal to the process.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Host resolution failed: {0}")]
    Resolve(#[from] CoreError),

    #[error("Failed to read body: {0}")]
    Body(String),

    #[error("Failed to decompress body: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Failed to compress body: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Invalid rewrite pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Malformed Location header {0:?}")]
    Location(String),

    #[error("Invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    #[error("Invalid upstream URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("Middleware {name} failed: {source}")]
    Middleware {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error communicating with upstream: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Failed to sign token: {0}")]
    Signing(String),

    #[error("Failed to generate signing key: {0}")]
    KeyGeneration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
