use crate::services::{migration_coordinator::MigrationError, partition::StorageError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<MigrationError> for AppError {
    fn from(err: MigrationError) -> Self {
        let status = match &err {
            MigrationError::NotFound { .. } => StatusCode::NOT_FOUND,
            MigrationError::AlreadyLocked { .. } | MigrationError::MaxRetriesExceeded { .. } => {
                StatusCode::CONFLICT
            }
            MigrationError::IntegrityError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MigrationError::SameTier(_) => StatusCode::BAD_REQUEST,
            MigrationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tier::Tier;
    use uuid::Uuid;

    #[test]
    fn migration_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (
                MigrationError::NotFound { id, tier: Tier::Hot },
                StatusCode::NOT_FOUND,
            ),
            (MigrationError::AlreadyLocked { id }, StatusCode::CONFLICT),
            (
                MigrationError::MaxRetriesExceeded {
                    id,
                    attempts: 3,
                    last_error: None,
                },
                StatusCode::CONFLICT,
            ),
            (MigrationError::SameTier(Tier::Cold), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn storage_errors_are_internal() {
        let err = AppError::from(StorageError::Unavailable {
            tier: Tier::Warm,
            reason: "down".into(),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "warm partition unavailable: down");
    }
}
