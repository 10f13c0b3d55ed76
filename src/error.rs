// Error taxonomy for the gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No usable credentials. Open the upstream console in a browser and make sure the harvester is connected.")]
    NoCredential,

    #[error("Timed out after {}s waiting for {what}", .waited.as_secs())]
    RefreshTimeout { what: &'static str, waited: Duration },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Upstream Error: {status} - {body}")]
    Upstream { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// OpenAI-style `error.type` for this failure
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::NoCredential => "no_credentials",
            GatewayError::RefreshTimeout { .. } => "refresh_timeout",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Request(_) => "request_error",
            GatewayError::InvalidCredential(_) | GatewayError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            GatewayError::Config(_) => "config_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoCredential | GatewayError::RefreshTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream { .. } | GatewayError::Request(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidCredential(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_payload())).into_response()
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_keeps_status_and_body() {
        let err = GatewayError::Upstream {
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream Error: 500 - boom");
        assert_eq!(err.to_payload()["error"]["type"], "upstream_error");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_refresh_timeout_message() {
        let err = GatewayError::RefreshTimeout {
            what: "credentials",
            waited: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "Timed out after 60s waiting for credentials");
    }
}
