use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Every flow either returns a value or fails with exactly one of these.
/// The `IntoResponse` impl maps the kind to an HTTP status and a user-safe
/// message; internal detail stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("email already registered")]
    EmailAlreadyExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("unauthorized")]
    Unauthorized,

    #[error("user not found")]
    NotFound,

    #[error("email delivery failed")]
    DeliveryFailed,

    #[error("database error")]
    Database(sqlx::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

/// The sign-up pre-check races with concurrent inserts; the unique index on
/// `email_address` is the real guard, so its violation surfaces as the same
/// duplicate-email failure rather than a 500.
impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return ApiError::EmailAlreadyExists;
            }
        }
        ApiError::Database(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    #[serde(rename = "statusCode")]
    status_code: u16,
    message: String,
    data: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::EmailAlreadyExists => (
                StatusCode::BAD_REQUEST,
                "User already exists with same email.".to_string(),
            ),
            Self::InvalidCredentials => (
                StatusCode::FORBIDDEN,
                "Provided credentials are Invalid.".to_string(),
            ),
            Self::InvalidOrExpiredCode => (
                StatusCode::PAYMENT_REQUIRED,
                "Provided code is invalid or expired.".to_string(),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized access.".to_string(),
            ),
            Self::NotFound => (StatusCode::UNAUTHORIZED, "User not found.".to_string()),
            Self::DeliveryFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong.".to_string(),
            ),
            Self::Database(e) => {
                tracing::error!(error = ?e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong.".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong.".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                status_code: status.as_u16(),
                message,
                data: None,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(
            status_of(ApiError::Validation("missing".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::EmailAlreadyExists),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::InvalidCredentials),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(ApiError::InvalidOrExpiredCode),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(status_of(ApiError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(ApiError::NotFound), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(ApiError::DeliveryFailed),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn error_body_uses_the_envelope_shape() {
        let response = ApiError::InvalidCredentials.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["statusCode"], 403);
        assert_eq!(body["message"], "Provided credentials are Invalid.");
        assert!(body["data"].is_null());
    }

    #[derive(Debug)]
    struct FakeUniqueViolation;

    impl std::fmt::Display for FakeUniqueViolation {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "duplicate key value violates unique constraint")
        }
    }

    impl std::error::Error for FakeUniqueViolation {}

    impl sqlx::error::DatabaseError for FakeUniqueViolation {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some("23505".into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn unique_violation_maps_to_email_already_exists() {
        let err = ApiError::from(sqlx::Error::Database(Box::new(FakeUniqueViolation)));
        assert!(matches!(&err, ApiError::EmailAlreadyExists));
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_database_errors_stay_internal() {
        let err = ApiError::from(sqlx::Error::RowNotFound);
        assert!(matches!(&err, ApiError::Database(_)));
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn internal_errors_never_leak_detail() {
        let err = ApiError::Internal(anyhow::anyhow!("secret connection string"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!body.contains("secret connection string"));
    }
}
