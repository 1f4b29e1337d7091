//! Proxy error types and response handling
//!
//! Maps each failure origin to the status the client sees: orchestrator
//! problems are 503, a cold start that never finished is 504, upstream dial
//! and mid-stream failures are 502. Request-body problems stay 400.

use crate::scale::ScaleError;
use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors that can occur during proxying
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProxyError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("request body not understood: {0}")]
    BadRequest(String),
    #[error("orchestrator unreachable: {0}")]
    OrchestratorUnreachable(String),
    #[error("backend cold start timed out: {0}")]
    ColdStartTimeout(String),
    #[error("could not reach backend: {0}")]
    UpstreamConnect(String),
    #[error("backend connection lost: {0}")]
    UpstreamMidStream(String),
    #[error("failed to build response: {0}")]
    ResponseBuild(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BodyRead(_) | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::OrchestratorUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ColdStartTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnect(_) | ProxyError::UpstreamMidStream(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::ResponseBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::BodyRead(_) => "body_read",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::OrchestratorUnreachable(_) => "orchestrator_unreachable",
            ProxyError::ColdStartTimeout(_) => "cold_start_timeout",
            ProxyError::UpstreamConnect(_) => "upstream_connect",
            ProxyError::UpstreamMidStream(_) => "upstream_mid_stream",
            ProxyError::ResponseBuild(_) => "response_build",
        }
    }
}

impl From<ScaleError> for ProxyError {
    fn from(err: ScaleError) -> Self {
        match err {
            ScaleError::ColdStartTimeout(_) => ProxyError::ColdStartTimeout(err.to_string()),
            ScaleError::OrchestratorUnreachable(_) | ScaleError::WarmUpAborted => {
                ProxyError::OrchestratorUnreachable(err.to_string())
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        tracing::error!("proxy error: {} - {}", status, self);

        let body = json!({
            "type": "error",
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}
