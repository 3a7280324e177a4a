use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Source address denied: {0}")]
    SourceDenied(String),

    #[error("No route matched: {0}")]
    NoRoute(String),

    #[error("No healthy member in backend set: {0}")]
    NoHealthyMember(String),

    #[error("Backend set not found: {0}")]
    UnknownBackendSet(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // Fixed rejections: a denied source and an unmatched path must be
            // distinguishable from a backend outage.
            GatewayError::SourceDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NoRoute(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoHealthyMember(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UnknownBackendSet(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::DependencyNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::SourceDenied(_) => "SOURCE_DENIED",
            GatewayError::NoRoute(_) => "NO_ROUTE",
            GatewayError::NoHealthyMember(_) => "NO_HEALTHY_MEMBER",
            GatewayError::UnknownBackendSet(_) => "UNKNOWN_BACKEND_SET",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::DependencyNotReady(_) => "DEPENDENCY_NOT_READY",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
