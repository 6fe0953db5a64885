/// Core error type for courier
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template inactive: {0}")]
    TemplateInactive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Suppressed: {0}")]
    Suppressed(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Rate limited: retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification recorded on delivery attempts.
///
/// These are the wire values stored in the `error_kind` column of the
/// delivery log and reported by channel adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Suppressed,
    InvalidHandle,
    RateLimited,
    Transient,
    Permanent,
    Exhausted,
    NoTokens,
    TooLong,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::InvalidHandle => "invalid_handle",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Exhausted => "exhausted",
            Self::NoTokens => "no_tokens",
            Self::TooLong => "too_long",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "suppressed" => Some(Self::Suppressed),
            "invalid_handle" => Some(Self::InvalidHandle),
            "rate_limited" => Some(Self::RateLimited),
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "exhausted" => Some(Self::Exhausted),
            "no_tokens" => Some(Self::NoTokens),
            "too_long" => Some(Self::TooLong),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_roundtrip() {
        for kind in [
            ErrorKind::Suppressed,
            ErrorKind::InvalidHandle,
            ErrorKind::RateLimited,
            ErrorKind::Transient,
            ErrorKind::Permanent,
            ErrorKind::Exhausted,
            ErrorKind::NoTokens,
            ErrorKind::TooLong,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("bogus"), None);
    }

    #[test]
    fn test_rate_limited_display() {
        let err = Error::RateLimited {
            retry_after_ms: 1500,
        };
        assert_eq!(err.to_string(), "Rate limited: retry in 1500ms");
    }
}
