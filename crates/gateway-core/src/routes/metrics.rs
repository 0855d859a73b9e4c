//! `GET /metrics` and `GET /metrics/prometheus` - the metrics registry's
//! two export formats.
//!
//! Grounded on `gateway/monitoring/metrics.py`'s `/metrics` endpoint
//! (JSON) and the Prometheus text-exposition rendering the teacher's
//! crate never had.

use actix_web::{web, HttpResponse};
use std::sync::Arc;

use crate::gateway::Gateway;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_json));
    cfg.route("/metrics/prometheus", web::get().to(metrics_prometheus));
}

async fn metrics_json(gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    HttpResponse::Ok().json(gateway.metrics.snapshot())
}

async fn metrics_prometheus(gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(gateway.metrics.export_prometheus())
}
