//! Error types for mailpost

use thiserror::Error;

/// Main error type for mailpost
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Validator error: {0}")]
    Validator(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Language detection error: {0}")]
    Language(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for mailpost
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable error code attached to pipeline failure logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Staging(_) => "STAGING_ERROR",
            Error::Validator(_) => "VALIDATOR_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Language(_) => "LANGUAGE_ERROR",
            Error::Webhook(_) => "WEBHOOK_ERROR",
            Error::Smtp(_) => "SMTP_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Staging("disk full".into()).code(), "STAGING_ERROR");
        assert_eq!(Error::Parse("bad mime".into()).code(), "PARSE_ERROR");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).code(), "IO_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Webhook("status 500".to_string());
        assert_eq!(err.to_string(), "Webhook error: status 500");
    }
}
