//! Explorer error types
//!
//! Upstream failures are classified so the pagination layer can decide what
//! to retry. Everything above the explorer uses `anyhow`.

use thiserror::Error;

/// Explorer request error
#[derive(Error, Debug)]
pub enum ExplorerError {
    /// Non-success HTTP status
    #[error("explorer returned HTTP {status}")]
    Http { status: u16 },

    /// HTTP 429
    #[error("explorer rate limited the request (429)")]
    RateLimited,

    /// Error object embedded in an otherwise successful response
    #[error("explorer API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Connection failure or timeout
    #[error("explorer request failed: {0}")]
    Transport(String),

    /// Response body did not match the expected shape
    #[error("failed to decode explorer response: {0}")]
    Decode(String),

    /// Retries used up; carries the last failure
    #[error("explorer request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ExplorerError>,
    },
}

impl ExplorerError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } | Self::RateLimited | Self::Api { .. } | Self::Transport(_) => true,
            Self::Decode(_) | Self::RetriesExhausted { .. } => false,
        }
    }
}

impl From<reqwest::Error> for ExplorerError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL embeds the API key
        let err = err.without_url();
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http { status: status.as_u16() }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_are_not_retried() {
        assert!(!ExplorerError::Decode("bad json".into()).is_retryable());
        assert!(ExplorerError::Http { status: 502 }.is_retryable());
        assert!(ExplorerError::Http { status: 400 }.is_retryable());
        assert!(ExplorerError::RateLimited.is_retryable());
        assert!(
            ExplorerError::Api {
                code: -32000,
                message: "overloaded".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn exhausted_error_reports_last_cause() {
        let err = ExplorerError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ExplorerError::RateLimited),
        };
        assert_eq!(
            err.to_string(),
            "explorer request failed after 3 attempts: explorer rate limited the request (429)"
        );
    }
}
