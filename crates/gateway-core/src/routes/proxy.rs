//! The catch-all reverse-proxy route: everything not matched by the
//! management endpoints falls through to the request pipeline.
//!
//! Grounded on the teacher's `services::http::RouteHandler`'s catch-all
//! `/{tail:.*}` pattern, rewired to call [`crate::pipeline::handle_request`]
//! instead of the teacher's static routing table.

use actix_web::{web, HttpRequest, HttpResponse};
use std::sync::Arc;

use crate::gateway::Gateway;
use crate::pipeline::{handle_request, IncomingRequest};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.default_service(web::route().to(proxy));
}

async fn proxy(req: HttpRequest, body: web::Bytes, gateway: web::Data<Arc<Gateway>>) -> HttpResponse {
    let peer_addr = req.peer_addr().map(|addr| addr.ip().to_string());
    let scheme = req.connection_info().scheme().to_string();

    let incoming = IncomingRequest {
        method: req.method().clone(),
        path: req.path(),
        query: req.query_string(),
        headers: req.headers(),
        body,
        peer_addr,
        scheme: &scheme,
    };

    handle_request(&gateway, incoming).await
}
