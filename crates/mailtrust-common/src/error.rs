//! Error types for mailtrust

use thiserror::Error;

/// Main error type for mailtrust
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A uniqueness constraint rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailtrust
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Conflict(_) => 409,
            Error::Dns(_) => 502,
            Error::Crypto(_) => 500,
            Error::Smtp(_) => 502,
            Error::Auth(_) => 401,
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::PermissionDenied(_) => 403,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::Dns(_) => "DNS_ERROR",
            Error::Crypto(_) => "CRYPTO_ERROR",
            Error::Smtp(_) => "SMTP_ERROR",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied(_) => "FORBIDDEN",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Conflict("dup".into()).status_code(), 409);
        assert_eq!(Error::PermissionDenied("no".into()).status_code(), 403);
        assert_eq!(Error::Auth("bad".into()).code(), "UNAUTHORIZED");
    }
}
