//! Error types for the IPFS client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpfsError {
    #[error("ipfs call timed out after {timeout_secs}s: {context}")]
    Timeout { timeout_secs: u64, context: String },

    #[error("ipfs connection error: {0}")]
    Connection(String),

    #[error("ipfs api error: {endpoint}, status: {status}, message: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("invalid response from ipfs api: {0}")]
    InvalidResponse(String),

    #[error("http request failed: {url}, error: {error}")]
    HttpRequest { url: String, error: String },
}

impl IpfsError {
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            Self::Timeout { .. } | Self::Connection(_) => Level::WARN,
            Self::HttpRequest { .. } => Level::WARN,
            // 5xx from the store is transient noise; 4xx means we sent garbage.
            Self::Api { status, .. } if *status >= 500 => Level::WARN,
            Self::Api { .. } => Level::ERROR,
            Self::InvalidResponse(_) => Level::ERROR,
        }
    }

    /// True when a caller-side retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection(_) | Self::HttpRequest { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for IpfsError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() {
            Self::Timeout {
                timeout_secs: 0,
                context: url,
            }
        } else if err.is_connect() {
            Self::Connection(format!("failed to connect to {}: {}", url, err))
        } else {
            Self::HttpRequest {
                url,
                error: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, IpfsError>;
