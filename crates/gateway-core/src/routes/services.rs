//! `GET /services` and `GET /services/{name}` - service catalogue
//! introspection.
//!
//! Grounded on `gateway/core/service_discovery.py::ServiceDiscovery`'s
//! `get_service_status`/`get_all_services_status`: an unknown service
//! name is reported as `status: "unknown"` with a 200, not a 404 - the
//! endpoint describes catalogue state, it doesn't route a request.

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

use crate::gateway::Gateway;
use crate::models::instance::Instance;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/services", web::get().to(all_services));
    cfg.route("/services/{name}", web::get().to(one_service));
}

async fn all_services(gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    let mut out = serde_json::Map::new();
    for service in gateway.registry.service_names() {
        out.insert(service.clone(), service_status(&gateway, &service));
    }
    HttpResponse::Ok().json(out)
}

async fn one_service(gateway: web::Data<Arc<Gateway>>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    HttpResponse::Ok().json(service_status(&gateway, &name))
}

fn service_status(gateway: &Gateway, name: &str) -> serde_json::Value {
    let instances = gateway.registry.list(name);
    if instances.is_empty() {
        return json!({ "service": name, "status": "unknown", "instances": [] });
    }

    let healthy_count = instances.iter().filter(|i| i.is_healthy()).count();
    json!({
        "service": name,
        "status": if healthy_count > 0 { "healthy" } else { "unhealthy" },
        "total_instances": instances.len(),
        "healthy_instances": healthy_count,
        "instances": instances.iter().map(instance_summary).collect::<Vec<_>>(),
    })
}

fn instance_summary(instance: &Instance) -> serde_json::Value {
    json!({
        "id": instance.id,
        "url": instance.base_url,
        "status": instance.status,
        "enabled": instance.enabled,
        "weight": instance.weight,
        "last_health_check": instance.last_check,
    })
}
