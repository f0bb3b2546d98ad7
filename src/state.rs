//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same value
//! - **RwLock**: any number of readers, or one writer
//!
//! The session itself is not behind a lock: it lives in the orchestrator task
//! and is reached through a cloneable [`SessionController`].

use crate::bridge::ClientBridge;
use crate::config::AppConfig;
use crate::session::{SessionController, SessionSettings};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Live configuration. `PUT /config` writes it; new sessions and the
    /// Azure clients read it.
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub session: SessionController,

    pub bridge: ClientBridge,

    pub start_time: Instant,
}

/// Request counters, overall and per endpoint.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by "METHOD path" (e.g. "POST /api/v1/session/start").
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        session: SessionController,
        bridge: ClientBridge,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            session,
            bridge,
            start_time: Instant::now(),
        }
    }

    fn read_config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_config(&self) -> AppConfig {
        self.read_config().clone()
    }

    /// Settings for a new session, taken from the current configuration.
    pub fn session_settings(&self) -> SessionSettings {
        self.read_config().session_settings()
    }

    /// Apply a partial JSON update. The stored config only changes if the
    /// merged result is valid.
    pub fn update_config(&self, json: &str) -> anyhow::Result<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        config.update_from_json(json)?;
        Ok(config.clone())
    }

    /// Record one finished request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
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
