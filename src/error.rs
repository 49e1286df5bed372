//! Error types for the CLI client and credential store.

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure talking to the API server
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-success response from the API server
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not logged in; run `appctl login` first")]
    NotLoggedIn,

    #[error("cannot locate home directory (HOME is not set)")]
    NoHomeDirectory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = Error::Api {
            status: 404,
            message: "deployment web not found".to_string(),
        };
        assert_eq!(err.to_string(), "API error (404): deployment web not found");
    }
}
