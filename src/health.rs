//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let active = state.sessions.active_count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path
        },
        "models": {
            "backend": state.models.backend(),
            "keywords": state.models.keywords()
        },
        "sessions": {
            "active": active,
            "max": state.sessions.max_sessions()
        },
        "memory": get_memory_info(),
        "system": get_system_status(active, state.sessions.max_sessions())
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "endpoints": endpoint_stats
        },
        "sessions": {
            "active": state.sessions.active_count(),
            "opened": metrics.sessions_opened,
            "closed": metrics.sessions_closed,
            "rejected": metrics.sessions_rejected,
            "live": state.sessions.summaries()
        },
        "frames": {
            "audio": metrics.audio_frames,
            "control_updates": metrics.control_updates,
            "control_ignored": metrics.control_ignored,
            "activations_sent": metrics.activations_sent,
            "pipeline_failures": metrics.pipeline_failures
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/{}/status", std::process::id());
        if let Ok(status) = std::fs::read_to_string(path) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(active: usize, max: usize) -> serde_json::Value {
    let session_usage = if max > 0 {
        active as f64 / max as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_with;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_keywords() {
        let state = state_with(&["hey_test", "other"], 0.0);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["models"]["keywords"], json!(["hey_test", "other"]));
        assert_eq!(body["models"]["backend"], "fixed");
        assert_eq!(body["sessions"]["active"], 0);
    }

    #[actix_web::test]
    async fn test_metrics_shape() {
        let state = state_with(&["hey_test"], 0.0);
        state.record_session_opened();
        state.record_session_rejected();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["sessions"]["opened"], 1);
        assert_eq!(body["sessions"]["rejected"], 1);
        assert_eq!(body["frames"]["activations_sent"], 0);
    }

    #[::core::prelude::v1::test]
    fn test_system_status_levels() {
        assert_eq!(get_system_status(0, 64)["status"], "normal");
        assert_eq!(get_system_status(50, 64)["status"], "moderate_load");
        assert_eq!(get_system_status(64, 64)["status"], "high_load");
    }
}
