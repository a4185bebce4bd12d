use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("unsupported operator '{operator}' for {value_type} values")]
    UnsupportedOperator {
        operator: String,
        value_type: String,
    },

    #[error("invalid time unit '{0}'")]
    InvalidTimeUnit(String),

    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("application not found: {kind} insight '{insight_id}'")]
    ApplicationNotFound { insight_id: String, kind: String },

    #[error("invalid application config: {0}")]
    ApplicationConfigInvalid(String),

    #[error("backend unavailable: {kind}: {reason}")]
    BackendUnavailable { kind: String, reason: String },

    #[error("statement execution failed for {backend} insight '{insight_id}': {source}")]
    StatementExecutionFailed {
        insight_id: String,
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Config(_)
            | ServiceError::ApplicationConfigInvalid(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::InvalidRequest(_)
            | ServiceError::InvalidIdentifier(_)
            | ServiceError::UnsupportedOperator { .. }
            | ServiceError::InvalidTimeUnit(_)
            | ServiceError::InvalidTimezone(_) => StatusCode::BAD_REQUEST,
            ServiceError::ApplicationNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::StatementExecutionFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_failures_do_not_leak_connection_strings() {
        let err = ServiceError::StatementExecutionFailed {
            insight_id: "shop".into(),
            backend: "warehouse-wide".into(),
            source: anyhow::anyhow!("relation \"orders\" does not exist"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("warehouse-wide insight 'shop'"));
        assert!(!rendered.contains("postgres://"));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn compile_errors_map_to_bad_request() {
        let err = ServiceError::UnsupportedOperator {
            operator: "sounds-like".into(),
            value_type: "string".into(),
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "unsupported operator 'sounds-like' for string values"
        );
    }
}
