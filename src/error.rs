use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Request-scoped error kinds, one per row of the error table in the design doc.
///
/// Every variant maps to exactly one HTTP status and an OpenAI-style error
/// envelope; retry-after and snapshot behavior are driven off the variant too.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("client cancelled the request")]
    ClientCancelled,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("model switch failed: {0}")]
    ModelSwitchFailed(String),
    #[error("page not ready")]
    PageNotReady,
    #[error("upstream page error: {0}")]
    UpstreamPlaywright(String),
    #[error("upstream returned no content")]
    UpstreamEmpty,
    #[error("rate limited")]
    RateLimit,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("response timed out")]
    ResponseTimeout,
    #[error("state resolution timeout")]
    ProcessingTimeoutAtGate,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientDisconnected | GatewayError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap()
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidModel(_) | GatewayError::ModelSwitchFailed(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            GatewayError::PageNotReady => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamPlaywright(_) | GatewayError::UpstreamEmpty => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::RateLimit => StatusCode::BAD_GATEWAY,
            GatewayError::QuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ResponseTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ProcessingTimeoutAtGate => StatusCode::from_u16(530).unwrap(),
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry-After in seconds, where the design doc names one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::PageNotReady => Some(30),
            GatewayError::UpstreamPlaywright(_) | GatewayError::UpstreamEmpty => Some(10),
            _ => None,
        }
    }

    /// Whether this error should trigger a diagnostic snapshot (dump of page
    /// state, recent logs) per the design doc's propagation policy.
    pub fn wants_snapshot(&self) -> bool {
        matches!(
            self,
            GatewayError::InternalError(_)
                | GatewayError::UpstreamPlaywright(_)
                | GatewayError::ResponseTimeout
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": "server_error",
                "param": serde_json::Value::Null,
                "code": serde_json::Value::Null,
            }
        }));
        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
