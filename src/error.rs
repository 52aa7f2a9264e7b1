use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("contact message not found: {0}")]
    ContactNotFound(String),
    #[error("chat is closed")]
    ChatClosed,
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),
    #[error("invalid notification id '{0}'")]
    InvalidNotificationId(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InvalidRating(_)
            | AppError::InvalidNotificationId(_) => StatusCode::BAD_REQUEST,
            AppError::ChatNotFound(_) | AppError::ContactNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ChatClosed => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Migration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION",
            AppError::ChatNotFound(_) => "CHAT_NOT_FOUND",
            AppError::ContactNotFound(_) => "CONTACT_NOT_FOUND",
            AppError::ChatClosed => "CHAT_CLOSED",
            AppError::InvalidRating(_) => "INVALID_RATING",
            AppError::InvalidNotificationId(_) => "INVALID_NOTIFICATION_ID",
            AppError::Database(_) | AppError::Migration(_) | AppError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "an internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(json!({ "error": { "code": self.code(), "message": message } })),
        )
            .into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}
