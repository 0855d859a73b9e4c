//! Gateway-wide error taxonomy.
//!
//! Every error that can reach the HTTP boundary is collapsed into
//! [`GatewayError`], which implements [`actix_web::ResponseError`] so
//! handlers can simply propagate with `?`. The four variants mirror the
//! four failure classes a request can end in: a problem with the
//! request itself, no upstream available, an upstream that failed, or
//! a defect inside the gateway.

use actix_web::{http::StatusCode, HttpResponse};
use serde_json::json;

/// Unified error type surfaced at the HTTP boundary.
///
/// Every variant carries (or is wrapped with) a correlation id by the
/// pipeline before it reaches [`ResponseError::error_response`], so the
/// body and the `X-Request-ID` header always agree.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The inbound request itself was malformed, unauthorized or
    /// throttled. Maps to a 4xx status.
    #[error("{message}")]
    ClientError { message: String, status: StatusCode, request_id: String },

    /// No healthy instance could be reached: empty healthy set or
    /// retries exhausted. Maps to 503.
    #[error("{message}")]
    UpstreamUnavailable { message: String, request_id: String },

    /// The circuit breaker for the target service is open. Maps to
    /// 503 with a fixed body that, unlike every other error variant,
    /// carries no `request_id` field - matching `gateway/main.py`'s
    /// `proxy_request` handler, which special-cases this one response
    /// body instead of routing it through the generic error envelope.
    #[error("circuit breaker is open")]
    CircuitOpen { request_id: String },

    /// The upstream was reached but the call failed: connection
    /// refused, timed out, or returned 5xx. Maps to 502, or to the
    /// upstream's own 5xx status when one was actually received.
    #[error("{message}")]
    UpstreamFault { message: String, status: StatusCode, request_id: String },

    /// A defect in the gateway itself. Details are logged, never
    /// leaked in the response body. Maps to 500.
    #[error("internal gateway error")]
    GatewayInternal { message: String, request_id: String },
}

impl GatewayError {
    pub fn client(message: impl Into<String>, status: StatusCode, request_id: impl Into<String>) -> Self {
        GatewayError::ClientError { message: message.into(), status, request_id: request_id.into() }
    }

    pub fn upstream_unavailable(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        GatewayError::UpstreamUnavailable { message: message.into(), request_id: request_id.into() }
    }

    pub fn circuit_open(request_id: impl Into<String>) -> Self {
        GatewayError::CircuitOpen { request_id: request_id.into() }
    }

    pub fn upstream_fault(message: impl Into<String>, status: StatusCode, request_id: impl Into<String>) -> Self {
        GatewayError::UpstreamFault { message: message.into(), status, request_id: request_id.into() }
    }

    pub fn internal(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("gateway internal error: {message}");
        GatewayError::GatewayInternal { message, request_id: request_id.into() }
    }

    /// The correlation id carried by this error, for logging call sites
    /// that don't have direct access to the request context anymore.
    pub fn request_id(&self) -> &str {
        match self {
            GatewayError::ClientError { request_id, .. } => request_id,
            GatewayError::UpstreamUnavailable { request_id, .. } => request_id,
            GatewayError::CircuitOpen { request_id } => request_id,
            GatewayError::UpstreamFault { request_id, .. } => request_id,
            GatewayError::GatewayInternal { request_id, .. } => request_id,
        }
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ClientError { status, .. } => *status,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamFault { status, .. } => *status,
            GatewayError::GatewayInternal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            GatewayError::GatewayInternal { request_id, .. } => {
                json!({ "error": "internal gateway error", "request_id": request_id })
            }
            GatewayError::CircuitOpen { .. } => {
                json!({ "error": "Service unavailable (circuit breaker open)" })
            }
            _ => json!({ "error": self.to_string(), "request_id": self.request_id() }),
        };
        HttpResponse::build(self.status_code())
            .insert_header(("X-Request-ID", self.request_id()))
            .json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::ResponseError;

    #[test]
    fn client_error_maps_to_given_status() {
        let err = GatewayError::client("bad path", StatusCode::BAD_REQUEST, "req-1");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upstream_unavailable_maps_to_503() {
        let err = GatewayError::upstream_unavailable("no healthy instance", "req-2");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn circuit_open_body_matches_the_fixed_literal_exactly() {
        let err = GatewayError::circuit_open("req-4");
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), br#"{"error":"Service unavailable (circuit breaker open)"}"#);
    }

    #[test]
    fn internal_error_never_leaks_message_in_body() {
        let err = GatewayError::internal("secret stack trace", "req-3");
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
