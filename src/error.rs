//! Error types for tarcollect.
//!
//! All library functions return `Result<T, CollectError>`. Conditions that
//! the pipeline reports but never fails on (a missing abstract, a query whose
//! pagination stopped early) are modelled as data in their own modules, not
//! here.

use thiserror::Error;

/// Main error type for collection operations.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Page could not be loaded, or did not settle within the timeout
    #[error("Fetch error for {url}: {message}")]
    Fetch {
        /// URL (or page description) that failed
        url: String,
        /// Underlying failure
        message: String,
    },

    /// Page or document structure was not recognised
    #[error("Parse error: {0}")]
    Parse(String),

    /// The browser process went away; nothing more can be fetched this run
    #[error("Browser session lost: {0}")]
    SessionLost(String),

    /// Browser automation error that leaves the session usable
    #[error("Browser error: {0}")]
    Browser(String),

    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// External API returned an error
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: i32,
        /// Error message
        message: String,
    },

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl CollectError {
    /// Build a fetch error for `url`.
    pub fn fetch(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// True when the whole batch has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

impl From<chromiumoxide::error::CdpError> for CollectError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        use chromiumoxide::error::CdpError;
        match err {
            CdpError::Ws(_) | CdpError::ChannelSendError(_) => Self::SessionLost(err.to_string()),
            other => Self::Browser(other.to_string()),
        }
    }
}

impl From<quick_xml::Error> for CollectError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Parse(format!("XML: {}", err))
    }
}

/// Result type alias using `CollectError`
pub type Result<T> = std::result::Result<T, CollectError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| CollectError::Parse(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_session_loss_is_fatal() {
        assert!(CollectError::SessionLost("crashed".into()).is_fatal());
        assert!(!CollectError::fetch("http://x", "timeout").is_fatal());
        assert!(!CollectError::Parse("bad".into()).is_fatal());
    }

    #[test]
    fn test_ok_or_parse() {
        let missing: Option<u8> = None;
        let err = missing.ok_or_parse("no title").expect_err("should fail");
        assert_eq!(err.to_string(), "Parse error: no title");
    }
}
