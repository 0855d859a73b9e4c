//! Gateway server entry point.
//!
//! Wires [`gateway_core::config::GatewayConfig`] into a
//! [`gateway_core::gateway::Gateway`] aggregate, spawns its health
//! checker, and serves the gateway's routes behind actix-web. Mirrors
//! the teacher's `kairos-gateway/src/main.rs` startup sequence:
//! configure logging, load and validate configuration, build the
//! service layer, then start the HTTP server with a graceful shutdown
//! on Ctrl-C.

use actix_web::{middleware::Logger, web, App, HttpServer};
use gateway_core::config::GatewayConfig;
use gateway_core::gateway::Gateway;
use gateway_core::logs::logger::configure_logger;
use gateway_core::routes;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config = GatewayConfig::from_env().unwrap_or_else(|err| {
        error!("failed to load configuration: {err}");
        std::process::exit(1);
    });

    info!("starting {} on {}:{}", config.app_name, config.gateway_host, config.gateway_port);

    let validation = config.validate();
    for warning in &validation.warnings {
        warn!("{warning}");
    }
    for recommendation in &validation.recommendations {
        info!("{recommendation}");
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{err}");
        }
        std::process::exit(1);
    }

    let host = config.gateway_host.clone();
    let port = config.gateway_port;

    let gateway = Arc::new(Gateway::new(config));
    let health_check_handle = gateway.spawn_health_checker();

    info!("registered {} service(s) at startup", gateway.registry.service_count());

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(gateway.clone()))
            .wrap(Logger::new(r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T"#))
            .wrap(actix_web::middleware::Compress::default())
            .configure(routes::configure)
    })
    .bind((host.as_str(), port))?
    .run();

    info!("server started successfully");

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped gracefully"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, stopping server...");
        }
    }

    health_check_handle.abort();
    Ok(())
}
