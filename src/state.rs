//! # Application State Management
//!
//! Shared state accessed by HTTP handlers and WebSocket sessions at the
//! same time. Everything mutable lives behind `Arc<RwLock<...>>`: many
//! readers or one writer, with the lock held only long enough to copy or
//! bump a counter.
//!
//! Relay sessions do not share any per-session state through here — each
//! WebSocket connection owns its own session. `AppState` only carries the
//! configuration and aggregate metrics.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Aggregate metrics, updated by middleware and relay sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Aggregate metrics across all HTTP requests and relay sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors since server start
    pub error_count: u64,

    /// Current number of active relay sessions (streaming upstream)
    pub active_sessions: u32,

    /// Audio chunks relayed to the upstream across all sessions
    pub audio_chunks_relayed: u64,

    /// Transcript segments forwarded to clients across all sessions
    pub transcript_segments: u64,

    /// Upstream exceptions and transport errors observed
    pub upstream_errors: u64,

    /// Per-endpoint statistics, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately; AppConfig is cheap to
    /// clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Called by middleware for every HTTP request.
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Called when any HTTP request fails.
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record per-endpoint latency and outcome.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

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

    /// A relay session entered the streaming state.
    pub fn increment_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions += 1;
    }

    /// A relay session left the streaming state.
    ///
    /// Guards against underflow so a double decrement cannot panic.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// An audio chunk was wrapped and sent upstream.
    pub fn record_audio_chunk(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.audio_chunks_relayed += 1;
    }

    /// Transcript segments were forwarded to a client.
    pub fn record_transcript_segments(&self, count: u64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.transcript_segments += count;
    }

    /// An upstream exception or transport error was observed.
    pub fn record_upstream_error(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.upstream_errors += 1;
    }

    /// Snapshot of current metrics for the metrics endpoints.
    ///
    /// Copies the data so no lock is held while the HTTP response is
    /// serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            audio_chunks_relayed: metrics.audio_chunks_relayed,
            transcript_segments: metrics.transcript_segments,
            upstream_errors: metrics.upstream_errors,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counter_does_not_underflow() {
        let state = AppState::new(AppConfig::default());

        state.increment_active_sessions();
        state.decrement_active_sessions();
        state.decrement_active_sessions();

        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_relay_counters_accumulate() {
        let state = AppState::new(AppConfig::default());

        state.record_audio_chunk();
        state.record_audio_chunk();
        state.record_transcript_segments(3);
        state.record_upstream_error();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.audio_chunks_relayed, 2);
        assert_eq!(snapshot.transcript_segments, 3);
        assert_eq!(snapshot.upstream_errors, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());

        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
