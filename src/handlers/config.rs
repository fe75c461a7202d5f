//! Read-only view of the effective configuration.
//!
//! The configuration is frozen at startup; there is no update endpoint.

use crate::{error::AppError, protocol, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = serde_json::to_value(state.config.as_ref())
        .map_err(|e| AppError::Internal(format!("failed to serialize configuration: {}", e)))?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "protocol": {
            "target_sample_rate": protocol::TARGET_SAMPLE_RATE,
            "default_sample_rate": protocol::DEFAULT_SAMPLE_RATE,
            "activation_threshold": protocol::ACTIVATION_THRESHOLD
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_with;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(&["hey_test"], 0.0)))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["server"]["ws_path"], "/ws");
        assert_eq!(body["config"]["models"]["inference_framework"], "onnx");
        assert_eq!(body["protocol"]["target_sample_rate"], 16_000);
        assert_eq!(body["protocol"]["activation_threshold"], 0.5);
    }

    #[actix_web::test]
    async fn test_config_is_read_only() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(&["hey_test"], 0.0)))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"server": {"port": 1}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }
}
