//! # Transcription Engine
//!
//! Coordinates model loading and inference for the HTTP layer.
//!
//! ## Key Responsibilities:
//! - **Lazy loading**: A model size is fetched and loaded on its first request
//! - **Residency**: Keeps up to `max_loaded_models` sizes in memory, evicting the
//!   least recently used one when a new size needs room
//! - **Inference**: Runs Whisper on the blocking thread pool so the async
//!   workers keep serving other requests
//! - **Performance monitoring**: Records per-model request metrics in the registry
//!
//! Handlers only see the [`SpeechEngine`] trait, which keeps them testable
//! without model weights.

use crate::error::AppError;
use crate::transcription::decoder::DecodeOptions;
use crate::transcription::model::{self, ModelSize, RawTranscript, WhisperModel};
use crate::transcription::registry::{current_timestamp, ModelRegistry, ModelStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::Device;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;

/// Samples plus everything needed to decode them.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// 16kHz mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub model: ModelSize,
    pub options: DecodeOptions,
}

/// Speech-to-text backend used by the service layer.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Run one request to completion.
    async fn transcribe(&self, request: EngineRequest) -> Result<RawTranscript>;

    /// Make sure `size` is resident (used for preloading).
    async fn ensure_loaded(&self, size: ModelSize) -> Result<()>;

    /// Status and metrics of every model size.
    fn registry(&self) -> &ModelRegistry;

    /// Short device name: "cpu", "cuda" or "metal".
    fn device_name(&self) -> String;

    fn gpu_available(&self) -> bool {
        self.device_name() != "cpu"
    }
}

type SharedModel = Arc<Mutex<WhisperModel>>;

/// Whisper-backed engine.
///
/// ## Thread Safety:
/// - The map of loaded models sits behind an async RwLock
/// - Each model has its own mutex because decoding mutates its caches;
///   requests for one size run one at a time, different sizes in parallel
/// - `load_lock` serialises loads so two requests never load the same size twice
pub struct WhisperEngine {
    models: RwLock<HashMap<ModelSize, SharedModel>>,
    load_lock: tokio::sync::Mutex<()>,
    registry: ModelRegistry,
    device: Device,
    cache_dir: PathBuf,
}

impl WhisperEngine {
    pub fn new(device: Device, cache_dir: PathBuf, max_loaded_models: usize, memory_limit_mb: u32) -> Self {
        tracing::info!(
            "Whisper engine on {} (cache {:?}, up to {} models / {} MB)",
            crate::device::describe(&device),
            cache_dir,
            max_loaded_models,
            memory_limit_mb
        );
        Self {
            models: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            registry: ModelRegistry::new(max_loaded_models, memory_limit_mb),
            device,
            cache_dir,
        }
    }

    /// Return the loaded model for `size`, loading it first if needed.
    async fn get_or_load(&self, size: ModelSize) -> Result<SharedModel> {
        if let Some(model) = self.models.read().await.get(&size) {
            return Ok(model.clone());
        }

        let _guard = self.load_lock.lock().await;

        // Another request may have finished loading while we waited
        if let Some(model) = self.models.read().await.get(&size) {
            return Ok(model.clone());
        }

        if !self.registry.fits_budget(size) {
            let message = format!(
                "Model {} needs about {} MB, more than the configured memory budget",
                size,
                size.memory_mb()
            );
            self.registry.mark_error(size, message.clone()).await;
            return Err(AppError::ModelUnavailable(message).into());
        }

        self.make_room_for(size).await?;

        match self.load(size).await {
            Ok(model) => {
                let model = Arc::new(Mutex::new(model));
                self.models.write().await.insert(size, model.clone());
                self.registry
                    .update_model_status(
                        size,
                        ModelStatus::Loaded {
                            loaded_at: current_timestamp(),
                            memory_mb: size.memory_mb(),
                        },
                    )
                    .await;
                Ok(model)
            }
            Err(e) => {
                tracing::error!("Failed to load Whisper {}: {:#}", size, e);
                self.registry.mark_error(size, format!("{:#}", e)).await;
                Err(AppError::ModelUnavailable(format!("Failed to load model {}: {}", size, e)).into())
            }
        }
    }

    /// Evict least recently used models until `size` fits.
    async fn make_room_for(&self, size: ModelSize) -> Result<()> {
        while !self.registry.can_load_model(size).await {
            let victim = self.registry.eviction_candidate(size).await.ok_or_else(|| {
                AppError::ModelUnavailable(format!("No room to load model {}", size))
            })?;

            tracing::info!("Unloading Whisper {} to make room for {}", victim, size);
            self.models.write().await.remove(&victim);
            self.registry
                .update_model_status(
                    victim,
                    ModelStatus::Unloaded {
                        unloaded_at: current_timestamp(),
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn load(&self, size: ModelSize) -> Result<WhisperModel> {
        let start_time = Instant::now();

        if model::cached_model_files(size, &self.cache_dir).is_none() {
            self.registry.update_model_status(size, ModelStatus::Downloading).await;
        }
        let files = model::fetch_model_files(size, &self.cache_dir).await?;

        self.registry.update_model_status(size, ModelStatus::Loading).await;
        let device = self.device.clone();
        let model = tokio::task::spawn_blocking(move || WhisperModel::from_files(size, &files, device))
            .await
            .map_err(|e| anyhow!("Model loading task failed: {}", e))??;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );
        Ok(model)
    }
}

#[async_trait]
impl SpeechEngine for WhisperEngine {
    async fn transcribe(&self, request: EngineRequest) -> Result<RawTranscript> {
        let size = request.model;
        let model = self.get_or_load(size).await?;
        self.registry.mark_used(size).await;

        let audio_seconds = request.samples.len() as f64 / crate::audio::SAMPLE_RATE as f64;
        let start_time = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("Whisper model lock poisoned"))?;
            model.transcribe(&request.samples, &request.options)
        })
        .await
        .map_err(|e| anyhow!("Transcription task failed: {}", e))
        .and_then(|result| result);

        let processing_ms = start_time.elapsed().as_millis() as u64;
        self.registry
            .record_request(size, audio_seconds, processing_ms, result.is_ok())
            .await;

        if let Err(e) = &result {
            tracing::error!("Whisper {} failed on {:.1}s of audio: {:#}", size, audio_seconds, e);
        }
        result
    }

    async fn ensure_loaded(&self, size: ModelSize) -> Result<()> {
        self.get_or_load(size).await.map(|_| ())
    }

    fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn device_name(&self) -> String {
        crate::device::describe(&self.device).to_string()
    }
}
