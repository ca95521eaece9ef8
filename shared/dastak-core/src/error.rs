//! Error types for Dastak comms services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommsError>;

#[derive(Error, Debug)]
pub enum CommsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Authorization error: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream provider failed: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommsError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::MissingInput(_) => 422,
            Self::RateLimited(_) => 429,
            Self::Upstream(_) => 502,
            Self::Unavailable(_) => 503,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MissingInput(_) => "MISSING_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Upstream(_) => "UPSTREAM_FAILED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for CommsError {
    fn from(err: std::io::Error) -> Self {
        CommsError::Network(err.to_string())
    }
}

impl From<reqwest::Error> for CommsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CommsError::Timeout(err.to_string())
        } else {
            CommsError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_public_contract() {
        assert_eq!(CommsError::Validation("x".into()).status_code(), 400);
        assert_eq!(CommsError::Auth("x".into()).status_code(), 401);
        assert_eq!(CommsError::NotFound("x".into()).status_code(), 404);
        assert_eq!(CommsError::Conflict("x".into()).status_code(), 409);
        assert_eq!(CommsError::MissingInput("x".into()).status_code(), 422);
        assert_eq!(CommsError::RateLimited("x".into()).status_code(), 429);
        assert_eq!(CommsError::Upstream("x".into()).status_code(), 502);
        assert_eq!(CommsError::Unavailable("x".into()).status_code(), 503);
    }
}
