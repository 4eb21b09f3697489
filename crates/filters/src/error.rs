use thiserror::Error;

/// Result type for filter construction
pub type Result<T> = std::result::Result<T, FilterError>;

/// Errors raised while building matchers. All of them are configuration errors and are meant to
/// abort startup.
#[derive(Error, Debug)]
pub enum FilterError {
    /// A rule or phrase produced a pattern the regex engine rejected
    #[error("Invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A phrase without any tokens
    #[error("Empty phrase")]
    EmptyPhrase,

    /// Rule definition that cannot be turned into a matcher
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
}

impl FilterError {
    pub(crate) fn pattern(pattern: impl Into<String>, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    }
}
