//! # Model Registry
//!
//! Tracks every Whisper size the service knows about: whether it is loaded,
//! when it was last used, and how it has performed. The engine consults the
//! registry before loading a model to decide what (if anything) to evict.
//!
//! ## Key Features:
//! - **Loading status management**: Downloading → Loading → Loaded → Unloaded, or Error
//! - **Resource accounting**: How many models and how much memory are resident
//! - **Eviction**: The least recently used loaded model makes room for a new one
//! - **Per-model metrics**: Requests, failures, audio seconds and processing time

use crate::protocol::ModelInfo;
use crate::transcription::model::ModelSize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Current status of a model in the registry.
///
/// ## State Transitions:
/// Available → Downloading → Loading → Loaded → Unloaded
/// Any state can transition to Error if something goes wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    /// Not resident; files may or may not be cached yet
    Available,

    /// Files are being fetched from HuggingFace
    Downloading,

    /// Files are on disk, weights are being loaded
    Loading,

    /// Ready for inference
    Loaded { loaded_at: u64, memory_mb: u32 },

    /// Was loaded, evicted to free memory
    Unloaded { unloaded_at: u64 },

    /// The last attempt to fetch or load failed
    Error { message: String, error_at: u64 },
}

impl ModelStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded { .. })
    }

    /// Get a human-readable status description.
    pub fn description(&self) -> String {
        match self {
            ModelStatus::Available => "Not loaded".to_string(),
            ModelStatus::Downloading => "Downloading model files".to_string(),
            ModelStatus::Loading => "Loading into memory".to_string(),
            ModelStatus::Loaded { .. } => "Ready for inference".to_string(),
            ModelStatus::Unloaded { .. } => "Unloaded to free memory".to_string(),
            ModelStatus::Error { message, .. } => format!("Error: {}", message),
        }
    }
}

/// Registry entry for a Whisper model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRegistryEntry {
    pub size: ModelSize,
    pub info: ModelInfo,
    pub status: ModelStatus,
    pub metrics: ModelMetrics,
    /// Position in the use order; larger means more recent, 0 means never
    pub last_used: u64,
    pub last_updated: u64,
}

/// Performance metrics for a model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Total audio processed (seconds)
    pub total_audio_seconds: f64,
    /// Total processing time (milliseconds)
    pub total_processing_ms: u64,
}

impl ModelMetrics {
    /// Calculate the success rate for this model.
    pub fn success_rate(&self) -> f32 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_requests - self.failed_requests) as f32 / self.total_requests as f32
        }
    }

    /// Audio seconds processed per wall-clock second.
    pub fn realtime_factor(&self) -> f64 {
        if self.total_processing_ms == 0 {
            0.0
        } else {
            (self.total_audio_seconds * 1000.0) / self.total_processing_ms as f64
        }
    }

    pub fn update(&mut self, audio_seconds: f64, processing_ms: u64, success: bool) {
        self.total_requests += 1;
        self.total_audio_seconds += audio_seconds;
        self.total_processing_ms += processing_ms;
        if !success {
            self.failed_requests += 1;
        }
    }
}

struct RegistryState {
    entries: HashMap<ModelSize, ModelRegistryEntry>,
    /// Monotonic use counter; timestamps are too coarse to order requests
    clock: u64,
}

/// Central registry for Whisper model status.
///
/// ## Thread Safety:
/// Uses RwLock to allow multiple concurrent readers (status checks) or
/// one writer (status updates) at a time.
pub struct ModelRegistry {
    state: RwLock<RegistryState>,

    /// Maximum number of models that can be loaded simultaneously
    max_loaded_models: usize,

    /// Total memory budget for loaded models
    memory_limit_mb: u32,
}

impl ModelRegistry {
    pub fn new(max_loaded_models: usize, memory_limit_mb: u32) -> Self {
        let entries = ModelSize::ALL
            .iter()
            .map(|&size| {
                let entry = ModelRegistryEntry {
                    size,
                    info: ModelInfo::from(size),
                    status: ModelStatus::Available,
                    metrics: ModelMetrics::default(),
                    last_used: 0,
                    last_updated: current_timestamp(),
                };
                (size, entry)
            })
            .collect();

        Self {
            state: RwLock::new(RegistryState { entries, clock: 0 }),
            max_loaded_models,
            memory_limit_mb,
        }
    }

    /// All entries, smallest model first.
    pub async fn list_models(&self) -> Vec<ModelRegistryEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.size);
        entries
    }

    #[cfg(test)]
    pub async fn get_model(&self, size: ModelSize) -> Option<ModelRegistryEntry> {
        self.state.read().await.entries.get(&size).cloned()
    }

    /// Sizes currently loaded, smallest first.
    pub async fn loaded_models(&self) -> Vec<ModelSize> {
        let state = self.state.read().await;
        let mut loaded: Vec<_> = state
            .entries
            .values()
            .filter(|entry| entry.status.is_loaded())
            .map(|entry| entry.size)
            .collect();
        loaded.sort();
        loaded
    }

    /// Update the status of a model.
    ///
    /// Called by the engine as a model moves through downloading,
    /// loading, loaded, unloaded or error.
    pub async fn update_model_status(&self, size: ModelSize, status: ModelStatus) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.entries.get_mut(&size) {
            tracing::debug!("Model {} status: {}", size, status.description());
            entry.status = status;
            entry.last_updated = current_timestamp();
        }
    }

    /// Convenience for the common failure transition.
    pub async fn mark_error(&self, size: ModelSize, message: impl Into<String>) {
        self.update_model_status(
            size,
            ModelStatus::Error {
                message: message.into(),
                error_at: current_timestamp(),
            },
        )
        .await;
    }

    /// Record that a request is using `size` right now.
    pub async fn mark_used(&self, size: ModelSize) {
        let mut state = self.state.write().await;
        state.clock += 1;
        let tick = state.clock;
        if let Some(entry) = state.entries.get_mut(&size) {
            entry.last_used = tick;
        }
    }

    /// Update performance metrics for a model.
    pub async fn record_request(&self, size: ModelSize, audio_seconds: f64, processing_ms: u64, success: bool) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.entries.get_mut(&size) {
            entry.metrics.update(audio_seconds, processing_ms, success);
            entry.last_updated = current_timestamp();
        }
    }

    /// Whether a single model of this size fits the memory budget at all.
    pub fn fits_budget(&self, size: ModelSize) -> bool {
        size.memory_mb() <= self.memory_limit_mb
    }

    /// Check if `size` can be loaded next to the models already resident.
    pub async fn can_load_model(&self, size: ModelSize) -> bool {
        let state = self.state.read().await;
        let loaded: Vec<_> = state
            .entries
            .values()
            .filter(|entry| entry.status.is_loaded() && entry.size != size)
            .collect();

        if loaded.len() >= self.max_loaded_models {
            return false;
        }

        let used: u32 = loaded.iter().map(|entry| entry.size.memory_mb()).sum();
        used + size.memory_mb() <= self.memory_limit_mb
    }

    /// The loaded model (other than `incoming`) that was used least recently.
    pub async fn eviction_candidate(&self, incoming: ModelSize) -> Option<ModelSize> {
        let state = self.state.read().await;
        state
            .entries
            .values()
            .filter(|entry| entry.status.is_loaded() && entry.size != incoming)
            .min_by_key(|entry| (entry.last_used, entry.size))
            .map(|entry| entry.size)
    }

    /// Get a summary of registry status.
    pub async fn summary(&self) -> RegistrySummary {
        let state = self.state.read().await;
        let loaded: Vec<_> = state
            .entries
            .values()
            .filter(|entry| entry.status.is_loaded())
            .collect();

        let mut loaded_models: Vec<_> = loaded.iter().map(|entry| entry.size).collect();
        loaded_models.sort();

        RegistrySummary {
            total_models: state.entries.len(),
            loaded_models,
            memory_used_mb: loaded.iter().map(|entry| entry.size.memory_mb()).sum(),
            memory_limit_mb: self.memory_limit_mb,
            max_loaded_models: self.max_loaded_models,
            total_requests: state.entries.values().map(|e| e.metrics.total_requests).sum(),
            failed_requests: state.entries.values().map(|e| e.metrics.failed_requests).sum(),
        }
    }
}

/// Summary of the model registry state.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_models: usize,
    pub loaded_models: Vec<ModelSize>,
    pub memory_used_mb: u32,
    pub memory_limit_mb: u32,
    pub max_loaded_models: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(size: ModelSize) -> ModelStatus {
        ModelStatus::Loaded {
            loaded_at: current_timestamp(),
            memory_mb: size.memory_mb(),
        }
    }

    #[test]
    fn test_model_status() {
        let status = ModelStatus::Available;
        assert!(!status.is_loaded());
        assert!(!ModelStatus::Loading.is_loaded());
        assert!(loaded(ModelSize::Tiny).is_loaded());
        assert_eq!(
            ModelStatus::Error { message: "boom".into(), error_at: 0 }.description(),
            "Error: boom"
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ModelStatus::Loaded { loaded_at: 1, memory_mb: 156 }).unwrap();
        assert_eq!(json["state"], "loaded");
        assert_eq!(json["memory_mb"], 156);
    }

    #[test]
    fn test_model_metrics() {
        let mut metrics = ModelMetrics::default();
        metrics.update(2.0, 1000, true);
        metrics.update(3.0, 1500, true);
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.success_rate(), 1.0);
        assert!((metrics.realtime_factor() - 2.0).abs() < 1e-9);

        metrics.update(1.0, 500, false);
        assert_eq!(metrics.failed_requests, 1);
        assert!((metrics.success_rate() - 0.667).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_registry_transitions() {
        let registry = ModelRegistry::new(2, 8192);
        assert_eq!(registry.list_models().await.len(), 5);
        assert!(registry.loaded_models().await.is_empty());

        registry.update_model_status(ModelSize::Tiny, ModelStatus::Downloading).await;
        registry.update_model_status(ModelSize::Tiny, ModelStatus::Loading).await;
        registry.update_model_status(ModelSize::Tiny, loaded(ModelSize::Tiny)).await;
        assert_eq!(registry.loaded_models().await, vec![ModelSize::Tiny]);

        registry.mark_error(ModelSize::Large, "download failed").await;
        let large = registry.get_model(ModelSize::Large).await.unwrap();
        assert!(matches!(large.status, ModelStatus::Error { .. }));
    }

    #[tokio::test]
    async fn test_capacity_limits() {
        let registry = ModelRegistry::new(2, 8192);
        registry.update_model_status(ModelSize::Tiny, loaded(ModelSize::Tiny)).await;
        registry.update_model_status(ModelSize::Base, loaded(ModelSize::Base)).await;

        // Two resident already
        assert!(!registry.can_load_model(ModelSize::Small).await);
        // Reloading a resident size never counts against itself
        assert!(registry.can_load_model(ModelSize::Base).await);

        let registry = ModelRegistry::new(4, 4096);
        registry.update_model_status(ModelSize::Medium, loaded(ModelSize::Medium)).await;
        // 3076 + 976 fits the 4096 budget, 3076 + 6200 does not
        assert!(registry.can_load_model(ModelSize::Small).await);
        assert!(!registry.can_load_model(ModelSize::Large).await);
        assert!(!registry.fits_budget(ModelSize::Large));
    }

    #[tokio::test]
    async fn test_eviction_picks_least_recently_used() {
        let registry = ModelRegistry::new(2, 8192);
        registry.update_model_status(ModelSize::Tiny, loaded(ModelSize::Tiny)).await;
        registry.update_model_status(ModelSize::Base, loaded(ModelSize::Base)).await;

        registry.mark_used(ModelSize::Tiny).await;
        registry.mark_used(ModelSize::Base).await;
        assert_eq!(registry.eviction_candidate(ModelSize::Small).await, Some(ModelSize::Tiny));

        registry.mark_used(ModelSize::Tiny).await;
        assert_eq!(registry.eviction_candidate(ModelSize::Small).await, Some(ModelSize::Base));

        // Never evict the model being loaded
        assert_eq!(registry.eviction_candidate(ModelSize::Base).await, Some(ModelSize::Tiny));
    }

    #[tokio::test]
    async fn test_summary() {
        let registry = ModelRegistry::new(2, 8192);
        registry.update_model_status(ModelSize::Base, loaded(ModelSize::Base)).await;
        registry.record_request(ModelSize::Base, 4.0, 800, true).await;
        registry.record_request(ModelSize::Base, 1.0, 200, false).await;

        let summary = registry.summary().await;
        assert_eq!(summary.total_models, 5);
        assert_eq!(summary.loaded_models, vec![ModelSize::Base]);
        assert_eq!(summary.memory_used_mb, 296);
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.failed_requests, 1);
    }
}
