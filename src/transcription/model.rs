//! # Whisper Model Management
//!
//! Catalogue of the five Whisper sizes, fetching their files from HuggingFace,
//! and the loaded candle model that turns samples into timestamped text.
//!
//! ## Model Loading Process:
//! 1. Resolve the cache directory (configured dir, `HF_HUB_CACHE`, `HF_HOME/hub`, default)
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors` unless cached
//! 3. Load tokenizer and configuration, build the mel filterbank
//! 4. Memory-map the weights onto the selected device
//!
//! Steps 3 and 4 are CPU bound; the engine runs them on the blocking pool.
//!
//! ## Memory Management:
//! Weights are kept in f32, so a model needs roughly four bytes per parameter.
//! The engine uses [`ModelSize::memory_mb`] to decide what it can keep resident.

use crate::transcription::decoder::{DecodeOptions, Decoder, RawSegment};
use crate::transcription::mel;
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Cache, Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Files every model needs, in download order.
pub const MODEL_FILES: [&str; 3] = ["config.json", "tokenizer.json", "model.safetensors"];

/// Seed for temperature sampling, fixed so reruns are reproducible.
const SAMPLING_SEED: u64 = 299_792_458;

/// Available Whisper model sizes with their characteristics.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: More memory usage for better results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl Default for ModelSize {
    fn default() -> Self {
        ModelSize::Base
    }
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate parameter count in millions (the usual "39M", "74M" ...).
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }

    /// Resident memory estimate for f32 weights.
    pub fn memory_mb(&self) -> u32 {
        self.size_mb() * 4
    }

    pub fn speed(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "fastest",
            ModelSize::Base => "fast",
            ModelSize::Small => "medium",
            ModelSize::Medium => "slow",
            ModelSize::Large => "slowest",
        }
    }

    pub fn accuracy(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "basic",
            ModelSize::Base => "good",
            ModelSize::Small => "better",
            ModelSize::Medium => "great",
            ModelSize::Large => "best",
        }
    }

    /// GPU memory needed to run the model comfortably.
    pub fn vram(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "1GB",
            ModelSize::Base => "1GB",
            ModelSize::Small => "2GB",
            ModelSize::Medium => "5GB",
            ModelSize::Large => "10GB",
        }
    }

    /// Names accepted by the API, joined for error messages.
    pub fn choices() -> String {
        Self::ALL
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!(
                "Invalid model '{}'. Choose from: {}",
                s,
                ModelSize::choices()
            )),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Local paths of a model's files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

/// Where model files live.
///
/// An explicit directory wins; otherwise the HuggingFace conventions
/// (`HF_HUB_CACHE`, then `HF_HOME/hub`, then `~/.cache/huggingface/hub`).
pub fn resolve_cache_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HF_HOME") {
        return PathBuf::from(home).join("hub");
    }
    Cache::default().path().clone()
}

/// Look up a model's files in the cache without touching the network.
pub fn cached_model_files(size: ModelSize, cache_dir: &Path) -> Option<ModelFiles> {
    let repo = Cache::new(cache_dir.to_path_buf())
        .repo(Repo::new(size.repo_name().to_string(), RepoType::Model));

    Some(ModelFiles {
        config: repo.get(MODEL_FILES[0])?,
        tokenizer: repo.get(MODEL_FILES[1])?,
        weights: repo.get(MODEL_FILES[2])?,
    })
}

/// Fetch a model's files, downloading whatever the cache is missing.
pub async fn fetch_model_files(size: ModelSize, cache_dir: &Path) -> Result<ModelFiles> {
    if let Some(files) = cached_model_files(size, cache_dir) {
        tracing::debug!("Using cached {} model files from {:?}", size, cache_dir);
        return Ok(files);
    }

    tracing::info!("Downloading {} from HuggingFace into {:?}", size.repo_name(), cache_dir);
    tracing::debug!("  HF_ENDPOINT: {:?}", std::env::var("HF_ENDPOINT"));
    tracing::debug!("  HF_TOKEN: {:?}", std::env::var("HF_TOKEN").map(|_| "***SET***"));

    let mut builder = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder
        .build()
        .map_err(|e| anyhow!("Failed to create HuggingFace client: {}", e))?;
    let repo = api.model(size.repo_name().to_string());

    let mut paths = Vec::with_capacity(MODEL_FILES.len());
    for file in MODEL_FILES {
        let path = repo
            .get(file)
            .await
            .map_err(|e| anyhow!("Failed to download {} from {}: {}", file, size.repo_name(), e))?;
        tracing::debug!("Fetched {} -> {:?}", file, path);
        paths.push(path);
    }

    let mut paths = paths.into_iter();
    match (paths.next(), paths.next(), paths.next()) {
        (Some(config), Some(tokenizer), Some(weights)) => Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        }),
        _ => Err(anyhow!("Incomplete download for {}", size.repo_name())),
    }
}

/// Text and segments produced from one upload, before speaker labelling.
#[derive(Debug, Clone, Default)]
pub struct RawTranscript {
    pub text: String,
    /// Language code that was supplied or detected
    pub language: String,
    pub segments: Vec<RawSegment>,
}

/// A loaded Whisper model ready for transcription.
///
/// ## Thread Safety:
/// Decoding mutates the model's attention caches, so the engine keeps each
/// model behind its own mutex and only one request uses it at a time.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
    size: ModelSize,
}

impl WhisperModel {
    /// Build the model from files already on disk.
    pub fn from_files(size: ModelSize, files: &ModelFiles, device: Device) -> Result<Self> {
        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("Failed to open {:?}", files.config))?,
        )?;
        tracing::debug!(
            "Model config: {} mel bins, vocab {}, {} encoder layers",
            config.num_mel_bins,
            config.vocab_size,
            config.encoder_layers
        );

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        // Fails early on a tokenizer that is not a Whisper tokenizer
        crate::transcription::decoder::SpecialTokens::from_tokenizer(&tokenizer)?;

        let mel_filters = mel::mel_filters(config.num_mel_bins);

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights.clone()], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        Ok(Self {
            model,
            config,
            tokenizer,
            mel_filters,
            device,
            size,
        })
    }

    /// Transcribe (or translate) 16kHz mono samples.
    ///
    /// ## Audio Requirements:
    /// - Sample rate: 16kHz
    /// - Format: 32-bit float, range [-1.0, 1.0]
    /// - Channels: Mono
    /// - Length: any; audio is processed in 30s windows
    pub fn transcribe(&mut self, samples: &[f32], options: &DecodeOptions) -> Result<RawTranscript> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let start_time = std::time::Instant::now();
        let mel = mel::log_mel(&self.config, samples, &self.mel_filters, &self.device)?;
        let content_frames = mel::content_frames(samples.len()).max(1);

        let mut decoder = Decoder::new(
            &mut self.model,
            &self.tokenizer,
            &self.config,
            options,
            SAMPLING_SEED,
        )?;

        let language = match &options.language {
            Some(code) => code.clone(),
            None => {
                let detected = decoder.detect_language(&mel)?;
                decoder.set_language(detected);
                detected.to_string()
            }
        };

        let segments = decoder.run(&mel, content_frames)?;
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        tracing::debug!(
            "Whisper {} processed {:.2}s of audio in {:.2}s ({} segments, language {})",
            self.size,
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            segments.len(),
            language
        );

        Ok(RawTranscript {
            text,
            language,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        let err = "huge".parse::<ModelSize>().unwrap_err().to_string();
        assert_eq!(err, "Invalid model 'huge'. Choose from: tiny, base, small, medium, large");
    }

    #[test]
    fn test_catalogue() {
        assert_eq!(ModelSize::default(), ModelSize::Base);
        assert_eq!(ModelSize::Tiny.speed(), "fastest");
        assert_eq!(ModelSize::Large.accuracy(), "best");
        assert_eq!(ModelSize::Medium.vram(), "5GB");
        assert_eq!(ModelSize::Large.repo_name(), "openai/whisper-large-v2");
        assert!(ModelSize::ALL.windows(2).all(|w| w[0].memory_mb() < w[1].memory_mb()));
    }

    #[test]
    fn test_resolve_cache_dir_prefers_explicit() {
        let dir = PathBuf::from("/srv/models");
        assert_eq!(resolve_cache_dir(Some(&dir)), dir);
    }

    #[test]
    fn test_cached_files_missing_in_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cached_model_files(ModelSize::Tiny, dir.path()).is_none());
    }

    #[test]
    fn test_cached_files_found_in_hub_layout() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("models--openai--whisper-tiny");
        let snapshot = repo_dir.join("snapshots").join("abc123");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::create_dir_all(repo_dir.join("refs")).unwrap();
        std::fs::write(repo_dir.join("refs").join("main"), "abc123").unwrap();
        for file in MODEL_FILES {
            std::fs::write(snapshot.join(file), b"{}").unwrap();
        }

        let files = cached_model_files(ModelSize::Tiny, dir.path()).unwrap();
        assert!(files.weights.ends_with("model.safetensors"));
        assert!(cached_model_files(ModelSize::Base, dir.path()).is_none());
    }
}
