use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Missing or invalid credentials.
    Unauthorized(String),
    /// Authenticated but not allowed (inactive account, missing role).
    Forbidden(String),
    /// Balance too low for the requested operation.
    InsufficientCredits(String),
    /// Search cooldown still active.
    RateLimited(String),
    /// Daily search cap reached.
    QuotaExceeded(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::InsufficientCredits(msg) => write!(f, "Insufficient credits: {}", msg),
            AppError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Message safe to show to the end user.
    ///
    /// Internal details (SQL errors, upstream bodies) are replaced with a
    /// generic message and only logged.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(_) | AppError::InternalError(_) => {
                "Internal server error".to_string()
            }
            AppError::ExternalApiError(_) => "External service error".to_string(),
            AppError::Unauthorized(_) => "Unauthorized".to_string(),
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::InsufficientCredits(msg)
            | AppError::RateLimited(msg)
            | AppError::QuotaExceeded(msg) => msg.clone(),
            AppError::WithContext { source, .. } => source.user_message(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::DatabaseError(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ExternalApiError(_) => StatusCode::BAD_GATEWAY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InsufficientCredits(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::RateLimited(_) | AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::WithContext { source, .. } => source.status(),
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    /// Logs errors according to their severity.
    fn into_response(self) -> Response {
        match &self {
            AppError::DatabaseError(e) => tracing::error!("Database error: {:?}", e),
            AppError::ExternalApiError(msg) => tracing::error!("External API error: {}", msg),
            AppError::InternalError(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Unauthorized(msg) => tracing::warn!("Unauthorized access: {}", msg),
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source)
            }
            _ => {}
        }

        let body = Json(json!({
            "error": self.user_message(),
        }));

        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_status_and_message() {
        let result: Result<(), AppError> =
            Err(AppError::InsufficientCredits("Add credits to continue".to_string()));
        let err = result.context("settling search").unwrap_err();

        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.user_message(), "Add credits to continue");
        assert!(err.to_string().starts_with("settling search: "));
    }

    #[test]
    fn test_database_errors_are_not_leaked() {
        let err = AppError::DatabaseError(sqlx::Error::RowNotFound);
        assert_eq!(err.user_message(), "Internal server error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
