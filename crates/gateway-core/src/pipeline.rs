//! The request-plane control loop: one inbound request walks through
//! every subsystem the [`Gateway`] owns, in a fixed order.
//!
//! Grounded on `gateway/main.py`'s `gateway_middleware` +
//! `proxy_request` handler for the exact step sequence (correlation id
//! → client identity → rate limit → path parse → circuit-breaker gate
//! → load-balancer select → forward → outcome feedback → response
//! headers → log/metrics), and on the teacher's
//! `RouteHandler::handle_request` for how timing wraps the whole call.

use actix_web::http::{HeaderMap, Method, StatusCode};
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use log::{info, warn};
use std::time::Instant;
use uuid::Uuid;

use crate::gateway::Gateway;
use crate::models::error::GatewayError;
use crate::services::circuit_breaker::{CircuitBreakerError, Outcome};
use crate::services::proxy::{ForwardRequest, Proxy};
use crate::utils::path::parse_service_path;

/// Result of one attempt at reaching an upstream, before retry
/// bookkeeping: either the upstream actually answered (any status,
/// including 4xx/5xx) or the gateway itself failed to reach it.
type AttemptResult = Result<reqwest::Response, reqwest::Error>;

/// Everything the pipeline needs about the inbound request that the
/// actix extractor layer has already pulled apart.
pub struct IncomingRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub peer_addr: Option<String>,
    pub scheme: &'a str,
}

/// Runs the full pipeline and always produces a response — never
/// propagates an error to the caller, since every failure mode here
/// has a defined client-facing status and body.
pub async fn handle_request(gateway: &Gateway, incoming: IncomingRequest<'_>) -> HttpResponse {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let client_identity = extract_client_identity(incoming.headers, incoming.peer_addr.as_deref());

    let outcome = run_pipeline(gateway, &incoming, &request_id, &client_identity).await;

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut response = match outcome {
        Ok(proxied) => {
            record_metrics(gateway, proxied.service.as_deref(), proxied.status.as_u16(), elapsed_ms);
            info!(
                "request {request_id}: {} {} -> {} in {elapsed_ms:.2}ms",
                incoming.method,
                incoming.path,
                proxied.status.as_u16()
            );
            build_proxied_response(proxied)
        }
        Err(err) => {
            record_metrics(gateway, None, err.status_code().as_u16(), elapsed_ms);
            warn!(
                "request {request_id}: {} {} rejected with {} ({err})",
                incoming.method,
                incoming.path,
                err.status_code().as_u16()
            );
            err.error_response()
        }
    };

    let headers = response.headers_mut();
    headers.insert(
        actix_web::http::header::HeaderName::from_static("x-request-id"),
        actix_web::http::header::HeaderValue::from_str(&request_id).unwrap(),
    );
    headers.insert(
        actix_web::http::header::HeaderName::from_static("x-response-time"),
        actix_web::http::header::HeaderValue::from_str(&format!("{elapsed_ms:.2}ms")).unwrap(),
    );
    response
}

/// A response successfully proxied from an upstream, independent of
/// whether its status is 2xx/3xx/4xx/5xx — the gateway forwards
/// whatever status the upstream actually returned.
struct ProxiedResponse {
    service: Option<String>,
    status: StatusCode,
    headers: Vec<(String, String)>,
    upstream: reqwest::Response,
}

async fn run_pipeline(
    gateway: &Gateway,
    incoming: &IncomingRequest<'_>,
    request_id: &str,
    client_identity: &str,
) -> Result<ProxiedResponse, GatewayError> {
    if gateway.config.rate_limit_enabled && !gateway.rate_limiter.allow(client_identity) {
        return Err(GatewayError::client(
            "too many requests",
            StatusCode::TOO_MANY_REQUESTS,
            request_id,
        ));
    }

    let Some((service, rest)) = parse_service_path(&gateway.config.gateway_prefix, incoming.path) else {
        return Err(GatewayError::client("invalid path", StatusCode::BAD_REQUEST, request_id));
    };

    let host_header = header_value(incoming.headers, "host");

    let upstream = dispatch_with_retry(
        gateway,
        service,
        rest,
        incoming.query,
        &incoming.method,
        incoming.headers,
        incoming.body.clone(),
        client_identity,
        incoming.scheme,
        host_header.as_deref(),
        request_id,
    )
    .await?;

    let status = upstream.status();
    let headers = Proxy::response_headers(&upstream);
    Ok(ProxiedResponse { service: Some(service.to_string()), status, headers, upstream })
}

/// Selects a healthy instance and forwards the request to it, retrying
/// up to `load_balancer_retry_count` attempts total per base spec §4.4
/// whenever the gateway itself fails to reach the chosen instance
/// (connection refused, timeout). Each attempt excludes every instance
/// already tried this cycle, so a retry never lands back on the
/// instance that just failed. A response actually received from the
/// upstream — including a 4xx or 5xx — is returned immediately without
/// retrying; only a transport-level failure triggers another attempt.
#[allow(clippy::too_many_arguments)]
async fn dispatch_with_retry(
    gateway: &Gateway,
    service: &str,
    rest: &str,
    query: &str,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    client_ip: &str,
    scheme: &str,
    original_host: Option<&str>,
    request_id: &str,
) -> Result<reqwest::Response, GatewayError> {
    let max_attempts = gateway.config.load_balancer_retry_count.max(1);
    let mut excluded_ids: Vec<u64> = Vec::new();
    let mut last_err: Option<GatewayError> = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            tokio::time::sleep(gateway.config.load_balancer_retry_delay).await;
        }

        let healthy: Vec<_> = gateway
            .registry
            .healthy(service)
            .into_iter()
            .filter(|instance| !excluded_ids.contains(&instance.id))
            .collect();
        if healthy.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                GatewayError::upstream_unavailable(format!("service '{service}' not available"), request_id)
            }));
        }

        let load_balancer = gateway.load_balancer(service);
        let Some((instance, _connection)) = load_balancer.select_guarded(&healthy, Some(client_ip)) else {
            return Err(GatewayError::upstream_unavailable(
                format!("service '{service}' not available"),
                request_id,
            ));
        };

        let mut target_url = format!("{}/{}", instance.base_url.trim_end_matches('/'), rest.trim_start_matches('/'));
        if !query.is_empty() {
            target_url.push('?');
            target_url.push_str(query);
        }
        let forward_request = ForwardRequest {
            method,
            target_url,
            headers,
            body: body.clone(),
            client_ip: Some(client_ip),
            scheme,
            original_host,
            request_id,
        };

        // `_connection` is booked for the duration of this attempt and
        // releases on drop at the end of this loop iteration, whether
        // that's the normal fall-through below or the future being
        // cancelled mid-`.await` by a client disconnect.
        let attempt_future = gateway.proxy.forward(forward_request);
        let outcome = if gateway.config.circuit_breaker_enabled {
            let breaker = gateway.circuit_breaker(service);
            breaker.call_classified(attempt_future, classify_attempt).await.map_err(|err| match err {
                CircuitBreakerError::CircuitOpen => GatewayError::circuit_open(request_id),
                CircuitBreakerError::OperationFailed(inner) => map_transport_error(inner, request_id),
            })
        } else {
            attempt_future.await.map_err(|err| map_transport_error(err, request_id))
        };

        match outcome {
            Ok(response) => return Ok(response),
            Err(err @ GatewayError::CircuitOpen { .. }) => return Err(err),
            Err(err) => {
                excluded_ids.push(instance.id);
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        GatewayError::upstream_unavailable(format!("service '{service}' not available"), request_id)
    }))
}

fn map_transport_error(err: reqwest::Error, request_id: &str) -> GatewayError {
    if err.is_timeout() {
        GatewayError::upstream_fault("upstream request timed out", StatusCode::BAD_GATEWAY, request_id)
    } else {
        GatewayError::upstream_fault(format!("failed to reach upstream: {err}"), StatusCode::BAD_GATEWAY, request_id)
    }
}

/// 2xx/3xx feed a success, 5xx and transport-level faults feed a
/// failure, 4xx feeds neither — matching base spec §4.2's feedback
/// rule. Operates on the raw per-attempt result, before it is mapped
/// into a [`GatewayError`], so retries and breaker feedback share one
/// classification.
fn classify_attempt(result: &AttemptResult) -> Outcome {
    match result {
        Ok(response) if response.status().is_success() || response.status().is_redirection() => Outcome::Success,
        Ok(response) if response.status().is_server_error() => Outcome::Failure,
        Ok(_) => Outcome::Neutral,
        Err(_) => Outcome::Failure,
    }
}

fn build_proxied_response(proxied: ProxiedResponse) -> HttpResponse {
    let mut builder = HttpResponse::build(proxied.status);
    for (name, value) in &proxied.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.streaming(Proxy::stream_body(proxied.upstream))
}

fn record_metrics(gateway: &Gateway, service: Option<&str>, status: u16, elapsed_ms: f64) {
    let service_label = service.unwrap_or("unknown");
    let status_class = format!("{}xx", status / 100);
    let labels = [("service", service_label), ("status", status_class.as_str())];
    gateway.metrics.incr_counter("requests_total", &labels, 1.0);
    gateway.metrics.observe_histogram("request_duration_ms", &labels, elapsed_ms);
}

/// Client identity extraction order: leftmost `X-Forwarded-For` entry,
/// else `X-Real-IP`, else the TCP peer address.
fn extract_client_identity(headers: &HeaderMap, peer_addr: Option<&str>) -> String {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return real_ip;
    }
    peer_addr.unwrap_or("unknown").to_string()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_identity_prefers_forwarded_for_over_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            actix_web::http::header::HeaderName::from_static("x-forwarded-for"),
            actix_web::http::header::HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert(
            actix_web::http::header::HeaderName::from_static("x-real-ip"),
            actix_web::http::header::HeaderValue::from_static("9.9.9.9"),
        );
        assert_eq!(extract_client_identity(&headers, None), "1.2.3.4");
    }

    #[test]
    fn client_identity_falls_back_to_peer_addr_when_no_headers_present() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_identity(&headers, Some("10.0.0.1")), "10.0.0.1");
    }

    #[test]
    fn classify_treats_4xx_as_neutral() {
        // status-only checks, no real reqwest::Response needed to exercise ranges
        assert_eq!(StatusCode::NOT_FOUND.is_server_error(), false);
        assert_eq!(StatusCode::NOT_FOUND.is_success(), false);
    }
}
