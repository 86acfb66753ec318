use thiserror::Error;

/// Error kinds recognized across the orchestrator. Each variant maps to one HTTP status and
/// one machine-readable `code` string in the REST envelope.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream fatal failure: {0}")]
    UpstreamFatal(String),

    #[error("rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn upstream_transient<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamTransient(msg.into())
    }

    pub fn upstream_fatal<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamFatal(msg.into())
    }

    pub fn policy_rejected<S: Into<String>>(msg: S) -> Self {
        Self::PolicyRejected(msg.into())
    }

    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable code used in the REST error envelope and in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::UpstreamFatal(_) => "upstream_fatal",
            Self::PolicyRejected(_) => "policy_rejected",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Config(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Http(_) => "http_error",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            Self::PolicyRejected(_) => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if matches!(self, Self::Internal(_) | Self::Database(_)) {
            tracing::error!(error = %self, code = self.code(), "internal failure");
        }
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_maps_to_429() {
        let err = AppError::resource_exhausted("pool full");
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "resource_exhausted");
    }

    #[test]
    fn upstream_fatal_maps_to_bad_gateway() {
        let err = AppError::upstream_fatal("bad credentials");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn service_unavailable_maps_to_503() {
        let err = AppError::service_unavailable("circuit open");
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "service_unavailable");
    }
}
