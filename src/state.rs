//! # Application State Management
//!
//! Shared state handed to every HTTP request handler through `web::Data`.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Every actix worker holds a reference to the same state
//! - **RwLock**: Metrics are read by `/metrics` and written by every request
//! - Configuration is immutable after startup, so it is only behind an `Arc`
//!
//! The transcription service (and the engine behind it) manages its own
//! locking; see `transcription::engine`.

use crate::config::AppConfig;
use crate::transcription::{SpeechEngine, TranscriptionService};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Request counters, updated by `MetricsMiddleware` on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub service: TranscriptionService,

    /// When the server started
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Responses with a 4xx/5xx status since server start
    pub error_count: u64,

    /// Uploads currently being decoded or transcribed
    pub active_transcriptions: u32,

    /// Key: endpoint (e.g., "POST /transcribe")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
    /// Request body bytes received (from `Content-Length`)
    pub upload_bytes: u64,
    /// Requests refused with 413
    pub rejected_uploads: u64,
}

/// One finished request, as seen by the metrics middleware.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestRecord {
    pub duration_ms: u64,
    /// The response was a 4xx/5xx
    pub is_error: bool,
    pub upload_bytes: u64,
    /// The response was a 413
    pub too_large: bool,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<dyn SpeechEngine>) -> Self {
        let service = TranscriptionService::new(
            engine,
            config.transcription.speaker_gap_seconds,
            config.transcription.temperature_fallback,
        );
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            service,
            start_time: Instant::now(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn SpeechEngine> {
        self.service.engine()
    }

    // A panic while holding the metrics lock leaves plain counters behind,
    // which are still safe to read and update.
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// `endpoint` is the method and route pattern (e.g., "POST /transcribe").
    pub fn record_endpoint_request(&self, endpoint: &str, record: RequestRecord) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += record.duration_ms;
        endpoint_metric.upload_bytes += record.upload_bytes;
        if record.is_error {
            endpoint_metric.error_count += 1;
        }
        if record.too_large {
            endpoint_metric.rejected_uploads += 1;
        }
    }

    pub fn increment_active_transcriptions(&self) {
        self.metrics_write().active_transcriptions += 1;
    }

    /// Includes an underflow check so a stray decrement cannot wrap the counter.
    pub fn decrement_active_transcriptions(&self) {
        let mut metrics = self.metrics_write();
        metrics.active_transcriptions = metrics.active_transcriptions.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning releases the lock before the response is serialised.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
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

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// Decrements the in-flight counter when a transcription handler returns,
/// whichever path it returns by.
pub struct ActiveTranscription<'a> {
    state: &'a AppState,
}

impl<'a> ActiveTranscription<'a> {
    pub fn start(state: &'a AppState) -> Self {
        state.increment_active_transcriptions();
        Self { state }
    }
}

impl Drop for ActiveTranscription<'_> {
    fn drop(&mut self) {
        self.state.decrement_active_transcriptions();
    }
}
