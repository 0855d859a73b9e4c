//! `GET /health` - aggregate health of every registered instance.
//!
//! Grounded on `gateway/monitoring/health_check.py::HealthChecker.get_overall_status`
//! for the response shape and the healthy/unhealthy/degraded rollup rule.

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

use crate::gateway::Gateway;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health));
}

async fn health(gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    let mut checks = serde_json::Map::new();
    let mut healthy_count = 0usize;
    let mut unhealthy_count = 0usize;

    for service in gateway.registry.service_names() {
        for instance in gateway.registry.list(&service) {
            let status = match instance.status {
                crate::models::instance::ServiceStatus::Healthy => {
                    healthy_count += 1;
                    "healthy"
                }
                crate::models::instance::ServiceStatus::Unhealthy => {
                    unhealthy_count += 1;
                    "unhealthy"
                }
                crate::models::instance::ServiceStatus::Disabled => "disabled",
                crate::models::instance::ServiceStatus::Unknown => "unknown",
            };
            checks.insert(
                format!("{}:{}", service, instance.id),
                json!({
                    "status": status,
                    "last_check": instance.last_check,
                    "last_error": serde_json::Value::Null,
                    "consecutive_failures": instance.consecutive_failures,
                    "consecutive_successes": instance.consecutive_successes,
                }),
            );
        }
    }

    let total = checks.len();
    if total == 0 {
        return HttpResponse::Ok().json(json!({
            "status": "unknown",
            "message": "No health checks configured",
        }));
    }

    let (status, message) = if healthy_count == total {
        ("healthy", "All systems operational")
    } else if unhealthy_count == total {
        ("unhealthy", "All systems down")
    } else if unhealthy_count * 2 > total {
        ("unhealthy", "Major systems down")
    } else {
        ("degraded", "Some systems degraded")
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "message": message,
        "total_checks": total,
        "healthy_checks": healthy_count,
        "unhealthy_checks": unhealthy_count,
        "checks": checks,
    }))
}
