//! # Wake-word Server - Main Application Entry Point
//!
//! Loads configuration and keyword models, then serves the WebSocket
//! endpoint and the HTTP surface until SIGINT or SIGTERM.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wakeword_server::classifier::ModelRegistry;
use wakeword_server::config::{AppConfig, CliArgs};
use wakeword_server::state::AppState;
use wakeword_server::{configure_routes, middleware};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = CliArgs::parse();
    let config = AppConfig::load(&cli)?;
    config.validate()?;

    info!("Starting wakeword-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        framework = %config.models.inference_framework,
        model_dir = %config.models.model_dir,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let models = ModelRegistry::load(&config.models, config.performance.classifier_threads)
        .context("failed to load keyword models")?;
    info!(keywords = ?models.keywords(), backend = models.backend(), "Models ready");

    let bind_addr = config.bind_addr();
    let ws_path = config.server.ws_path.clone();
    let app_state = web::Data::new(AppState::new(config, models));

    info!("Starting HTTP server on {} (WebSocket at {})", bind_addr, ws_path);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .configure(|cfg| configure_routes(cfg, &ws_path))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {}, stopping server...", name),
                Err(e) => error!("Signal handler failed, stopping server: {}", e),
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wakeword_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise tracing")?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
