//! # Wake-word Server
//!
//! Streams PCM audio over a WebSocket, classifies it for a set of keywords
//! and reports activations back to the client.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, file, environment, flags)
//! - **error**: error types and their HTTP responses
//! - **protocol**: wire messages and control-frame parsing
//! - **audio**: PCM decoding, resampling and the per-connection session
//! - **classifier**: classifier trait, model registry and backends
//! - **websocket**: actix actor bridging the transport to a session
//! - **state / health / handlers / middleware**: the HTTP surface

pub mod audio;
pub mod classifier;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod protocol;
pub mod state;
pub mod websocket;

use actix_web::web;

/// Register every route. Shared by the binary and the integration tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig, ws_path: &str) {
    cfg.route(ws_path, web::get().to(websocket::audio_websocket))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(handlers::get_config))
                .route("/models", web::get().to(handlers::list_models))
                .route("/models/{keyword}", web::get().to(handlers::get_model)),
        )
        .route("/health", web::get().to(health::health_check));
}
