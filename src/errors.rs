use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Stable, language-neutral error kinds. Each maps to one HTTP status and one
/// stable `code` string clients can branch on.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// A license `Validate` rejection, carrying one of the precise reasons from §7
    /// (`LICENSE_EXPIRED`, `LICENSE_REVOKED`, `INVALID_NONCE`, `INVALID_SIGNATURE`,
    /// `DEVICE_BLOCKED`, `LICENSE_OFFLINE_EXPIRED`) as the stable `code`.
    #[error("{message}")]
    LicenseRejected { code: &'static str, message: String },

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64, details: Value },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String, Value),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::LicenseRejected { code, .. } => code,
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::ResourceExhausted(..) => "RESOURCE_EXHAUSTED",
            AppError::Unavailable(_) => "UNAVAILABLE",
            AppError::Timeout => "TIMEOUT",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::LicenseRejected { .. } => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ResourceExhausted(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Value {
        match self {
            AppError::RateLimited { details, .. } => details.clone(),
            AppError::ResourceExhausted(_, details) => details.clone(),
            _ => Value::Null,
        }
    }

}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
    meta: Meta,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    details: Value,
}

#[derive(Serialize)]
struct Meta {
    timestamp: String,
    request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
            meta: Meta {
                timestamp: chrono::Utc::now().to_rfc3339(),
                request_id: Uuid::new_v4().to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Wraps a successful payload in the `{success:true, data, meta, pagination?}` envelope.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub meta: EnvelopeMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Serialize)]
pub struct EnvelopeMeta {
    pub timestamp: String,
    pub request_id: String,
}

#[derive(Serialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope {
            success: true,
            data,
            meta: EnvelopeMeta {
                timestamp: chrono::Utc::now().to_rfc3339(),
                request_id: Uuid::new_v4().to_string(),
            },
            pagination: None,
        }
    }

    pub fn paginated(data: T, limit: i64, offset: i64, total: i64) -> Self {
        let mut env = Self::ok(data);
        env.pagination = Some(Pagination { limit, offset, total });
        env
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_400_bad_request() {
        let err = AppError::InvalidArgument("message must not be empty".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn rate_limited_carries_retry_after_in_details() {
        let err = AppError::RateLimited {
            retry_after_secs: 120,
            details: serde_json::json!({"limit": 10, "window_secs": 3600}),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.details()["limit"], 10);
    }

    #[test]
    fn envelope_ok_sets_success_true_and_no_pagination() {
        let env = Envelope::ok(serde_json::json!({"x": 1}));
        assert!(env.success);
        assert!(env.pagination.is_none());
    }

    #[test]
    fn license_rejected_keeps_its_specific_code_distinct_from_conflict() {
        let err = AppError::LicenseRejected { code: "INVALID_NONCE", message: "presented nonce does not match".to_string() };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "INVALID_NONCE");
        assert_ne!(err.code(), AppError::Conflict("x".to_string()).code());
    }
}
