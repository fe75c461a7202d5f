//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket actor.
//!
//! Most of it is read-only after startup: the configuration and the model
//! registry are plain `Arc`s and are never mutated. The session manager does
//! its own locking. Only the metrics need an `Arc<RwLock<_>>`, since every
//! request and every audio frame updates them.
//!
//! Lock poisoning is tolerated: a panic in one handler must not take the
//! metrics endpoint down with it.

use crate::audio::session::{FrameOutcome, SessionManager};
use crate::classifier::ModelRegistry;
use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, frozen at startup
    pub config: Arc<AppConfig>,

    /// Loaded keyword models and the per-session classifier factory
    pub models: Arc<ModelRegistry>,

    /// Live WebSocket sessions
    pub sessions: Arc<SessionManager>,

    /// Counters for the metrics endpoint
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// HTTP requests seen by the metrics middleware
    pub request_count: u64,
    pub error_count: u64,

    pub sessions_opened: u64,
    pub sessions_closed: u64,
    /// Upgrades refused because the session limit was reached
    pub sessions_rejected: u64,

    pub audio_frames: u64,
    pub control_updates: u64,
    pub control_ignored: u64,
    /// Activation messages sent to clients
    pub activations_sent: u64,
    /// Sessions terminated by a classifier or resampler failure
    pub pipeline_failures: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, models: ModelRegistry) -> Self {
        let sessions = SessionManager::new(config.performance.max_concurrent_sessions);
        Self {
            config: Arc::new(config),
            models: Arc::new(models),
            sessions: Arc::new(sessions),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_opened(&self) {
        self.metrics_mut().sessions_opened += 1;
    }

    pub fn record_session_closed(&self) {
        self.metrics_mut().sessions_closed += 1;
    }

    pub fn record_session_rejected(&self) {
        self.metrics_mut().sessions_rejected += 1;
    }

    pub fn record_pipeline_failure(&self) {
        self.metrics_mut().pipeline_failures += 1;
    }

    /// Count one handled frame by what came out of it.
    pub fn record_outcome(&self, outcome: &FrameOutcome) {
        let mut metrics = self.metrics_mut();
        match outcome {
            FrameOutcome::RateUpdated(_) => metrics.control_updates += 1,
            FrameOutcome::ControlIgnored => metrics.control_ignored += 1,
            FrameOutcome::Silent => metrics.audio_frames += 1,
            FrameOutcome::Activation(_) => {
                metrics.audio_frames += 1;
                metrics.activations_sent += 1;
            }
            FrameOutcome::Ignored | FrameOutcome::Terminate => {}
        }
    }

    /// Copy of the counters, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
