//! Error types for the Tether gateway

use thiserror::Error;

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Tether gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown device, reservation, grant, session or node
    #[error("not found: {0}")]
    NotFound(String),

    /// Principal lacks the permission required for the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Device already leased, reservation overlap, or a terminal state
    #[error("conflict: {0}")]
    Conflict(String),

    /// A probe or send exceeded its bound
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed input (e.g. a reservation whose start is not before its end)
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid caller identity
    #[error("auth error: {0}")]
    Auth(String),

    /// Unexpected failure that does not fit another kind
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Stable, machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Conflict,
    Timeout,
    Validation,
    Unauthenticated,
    Internal,
}

impl ErrorKind {
    /// Wire code for this kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Validation => "validation_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Auth(_) => ErrorKind::Unauthenticated,
            Self::Internal(_)
            | Self::Config(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Serialization(_)
            | Self::Toml(_)
            | Self::Sqlite(_) => ErrorKind::Internal,
        }
    }

    /// Collapse collaborator failures into `Internal`
    ///
    /// Core operations return this form so store, HTTP and codec errors never
    /// reach callers as their raw variants.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self.kind() {
            ErrorKind::Internal if !matches!(self, Self::Internal(_)) => {
                tracing::error!(error = %self, "collaborator failure");
                Self::Internal(self.to_string())
            }
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(Error::NotFound("d".into()).kind().as_str(), "not_found");
        assert_eq!(
            Error::PermissionDenied("x".into()).kind().as_str(),
            "permission_denied"
        );
        assert_eq!(Error::Conflict("x".into()).kind().as_str(), "conflict");
        assert_eq!(Error::Timeout("x".into()).kind().as_str(), "timeout");
        assert_eq!(
            Error::Validation("x".into()).kind().as_str(),
            "validation_error"
        );
    }

    #[test]
    fn normalize_hides_collaborator_variants() {
        let err = Error::Database("disk I/O error".into()).normalize();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = Error::Conflict("leased".into()).normalize();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
