// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines the error taxonomy and its HTTP responses.
//
// Domain failures (not found, forbidden, conflicts, state errors) are typed
// variants surfaced synchronously to the caller with enough detail to correct
// the request. Infrastructure failures (PostgreSQL, Redis, bcrypt) map to a
// generic 500 with the cause logged, never exposed in the response body.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Session store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Password hashing/verification failed
    #[error("Credential error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // -------------------------------------------------------------------------
    // AUTHENTICATION / AUTHORIZATION
    // -------------------------------------------------------------------------
    /// Missing, malformed or stale credentials
    #[error("Authentication required")]
    Unauthenticated,

    /// The caller is authenticated but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // -------------------------------------------------------------------------
    // DOMAIN ERRORS
    // -------------------------------------------------------------------------
    /// Book, user or loan record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Another book already carries this ISBN
    #[error("ISBN already in use: {0}")]
    DuplicateIsbn(String),

    /// Ownership transfer target missing or not a bookkeeper
    #[error("Invalid new owner: {0}")]
    InvalidNewOwner(String),

    /// Ownership transfer targeting the current owner
    #[error("Transfer target is already the current owner")]
    NoOpTransfer,

    /// Issue attempted with no copy on the shelf
    #[error("No copies available")]
    NoCopiesAvailable,

    /// Book deletion blocked by outstanding loans
    #[error("Book has {0} active loan(s)")]
    HasActiveLoans(i64),

    /// Return code does not match the stored one-time code
    #[error("Invalid one-time code")]
    InvalidCode,

    /// Return code matched but its validity window has passed
    #[error("One-time code has expired")]
    CodeExpired,
}

impl AppError {
    /// Stable machine-readable code included in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "SESSION_STORE_ERROR",
            AppError::Bcrypt(_) => "CREDENTIAL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DuplicateIsbn(_) => "DUPLICATE_ISBN",
            AppError::InvalidNewOwner(_) => "INVALID_NEW_OWNER",
            AppError::NoOpTransfer => "NO_OP_TRANSFER",
            AppError::NoCopiesAvailable => "NO_COPIES_AVAILABLE",
            AppError::HasActiveLoans(_) => "HAS_ACTIVE_LOANS",
            AppError::InvalidCode => "INVALID_CODE",
            AppError::CodeExpired => "CODE_EXPIRED",
        }
    }

    /// HTTP status the variant maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            // Business-rule conflicts
            AppError::DuplicateIsbn(_)
            | AppError::InvalidNewOwner(_)
            | AppError::NoOpTransfer
            | AppError::NoCopiesAvailable
            | AppError::HasActiveLoans(_) => StatusCode::CONFLICT,
            // The request was well-formed but the code check failed
            AppError::InvalidCode | AppError::CodeExpired => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Bcrypt(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
// Implementing IntoResponse lets handlers return Result<T, AppError> and have
// failures converted to proper HTTP responses automatically.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.code();

        // Internal failures: log the cause, mask the message
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error_code = error_code,
                cause = %self,
                "Request failed with internal error"
            );
            "An internal error occurred".to_string()
        } else {
            tracing::warn!(
                error_code = error_code,
                message = %self,
                "Request failed"
            );
            self.to_string()
        };

        let body = ErrorResponse::new(error_code, message);

        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_client_statuses() {
        assert_eq!(
            AppError::NotFound("book".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Forbidden("not owner".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::DuplicateIsbn("978-0".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(AppError::NoOpTransfer.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::InvalidNewOwner("not a bookkeeper".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::NoCopiesAvailable.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::HasActiveLoans(2).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InvalidCode.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::CodeExpired.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_infrastructure_errors_map_to_500() {
        assert_eq!(
            AppError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AppError::NoCopiesAvailable.code(), "NO_COPIES_AVAILABLE");
        assert_eq!(AppError::InvalidCode.code(), "INVALID_CODE");
        assert_eq!(AppError::CodeExpired.code(), "CODE_EXPIRED");
        assert_eq!(AppError::NoOpTransfer.code(), "NO_OP_TRANSFER");
        assert_eq!(AppError::DuplicateIsbn("x".into()).code(), "DUPLICATE_ISBN");
        assert_eq!(
            AppError::InvalidNewOwner("x".into()).code(),
            "INVALID_NEW_OWNER"
        );
    }
}
