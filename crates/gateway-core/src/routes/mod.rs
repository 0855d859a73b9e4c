//! HTTP route handlers: the web interface layer clients interact with.
//!
//! # Module Organization
//!
//! - [`health`] - `GET /health` aggregate health rollup
//! - [`services`] - `GET /services`, `GET /services/{name}` catalogue introspection
//! - [`metrics`] - `GET /metrics`, `GET /metrics/prometheus` metric export
//! - [`proxy`] - the catch-all reverse-proxy route backing every other path
//!
//! Register all four with [`configure`] against an actix-web
//! `ServiceConfig`; `proxy::configure` must be applied last since it
//! installs the default (catch-all) service.

pub mod health;
pub mod metrics;
pub mod proxy;
pub mod services;

use actix_web::web;

/// Wires every route module into `cfg`, in the order that lets the
/// management endpoints take precedence over the proxy catch-all.
pub fn configure(cfg: &mut web::ServiceConfig) {
    health::configure(cfg);
    services::configure(cfg);
    metrics::configure(cfg);
    proxy::configure(cfg);
}
