use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// API-surface error with a structured JSON body, mirroring the
/// `{"detail": ...}` shape clients already consume.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// An upstream collaborator (Gamma / Data API) failed or rejected us.
    Upstream(StatusCode, String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &str) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Upstream(status, msg) => (*status, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = self.parts();
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::NotFound(msg) => ApiError::NotFound(msg),
            crate::error::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Maps an upstream reqwest failure to a 502 with the transport detail.
pub fn upstream_error(context: &str, err: reqwest::Error) -> ApiError {
    ApiError::Upstream(StatusCode::BAD_GATEWAY, format!("{context}: {err}"))
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
