//! # Model Listing
//!
//! `GET /api/v1/models` reports the keywords every new session is served, in
//! handshake order, plus the files they were loaded from.
//!
//! ## Response:
//! ```json
//! {
//!   "backend": "onnx",
//!   "keywords": ["alexa_v0.1", "hey_jarvis_v0.1"],
//!   "models": [
//!     { "keyword": "alexa_v0.1", "path": "models/alexa_v0.1.onnx", "size_bytes": 854016 }
//!   ],
//!   "loaded_at": "2025-01-01T12:00:00Z"
//! }
//! ```

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};

pub async fn list_models(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.models.summary()))
}

/// `GET /api/v1/models/{keyword}`
pub async fn get_model(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let keyword = path.into_inner();
    let summary = state.models.summary();

    let position = summary
        .keywords
        .iter()
        .position(|k| *k == keyword)
        .ok_or_else(|| AppError::NotFound(format!("keyword '{}' is not loaded", keyword)))?;

    let file = summary.models.iter().find(|m| m.keyword == keyword);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "keyword": keyword,
        "position": position,
        "backend": summary.backend,
        "file": file
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_with;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_list_models_in_order() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(&["zeta", "alpha"], 0.0)))
                .route("/api/v1/models", web::get().to(list_models)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["keywords"], serde_json::json!(["zeta", "alpha"]));
        assert_eq!(body["backend"], "fixed");
    }

    #[actix_web::test]
    async fn test_get_model() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state_with(&["zeta", "alpha"], 0.0)))
                .route("/api/v1/models/{keyword}", web::get().to(get_model)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/models/alpha").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["position"], 1);

        let req = test::TestRequest::get().uri("/api/v1/models/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
