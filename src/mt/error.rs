use thiserror::Error;

/// Error types for the translation gateway
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MtError {
    /// The provider answered but could not translate the text
    #[error("Translation error: {0}")]
    TranslationError(String),
    /// The provider could not identify the language of a text
    #[error("Detection error: {0}")]
    DetectionError(String),
    /// Provider is misconfigured (missing key, rejected credentials)
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Transport-level failure talking to the provider
    #[error("Network error: {0}")]
    NetworkError(String),
    /// A locale code failed validation
    #[error("Invalid locale: {0}")]
    InvalidLocale(String),
}

impl From<reqwest::Error> for MtError {
    fn from(err: reqwest::Error) -> Self {
        MtError::NetworkError(err.to_string())
    }
}

/// Result type for MT operations
pub type MtResult<T> = Result<T, MtError>;
