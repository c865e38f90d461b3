//! # Configuration Management
//!
//! This module handles loading and managing the service configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT) and environment variables (APP_SERVER__PORT, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: Where the HTTP API listens and how large uploads may be
//! - **models**: Which Whisper model is the default, where weights are cached, device choice
//! - **audio**: ffmpeg conversion settings
//! - **transcription**: Speaker heuristic and decoding behaviour
//! - **client**: Defaults for the `ramble transcribe` command

use crate::transcription::model::ModelSize;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups keeps the environment variable
/// names predictable (`APP_<SECTION>__<FIELD>`) and the TOML file readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub transcription: TranscriptionSettings,
    pub client: ClientConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (containers, GPU hosts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted upload, in megabytes
    pub max_upload_mb: usize,
}

/// Whisper model configuration.
///
/// ## Fields:
/// - `default_model`: Size used when a request does not name one ("tiny" .. "large")
/// - `cache_dir`: Persistent directory for model weights. When unset the
///   HuggingFace cache (`HF_HUB_CACHE` / `HF_HOME`) is used.
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `max_loaded_models`: How many model sizes may stay resident at once
/// - `max_model_memory_mb`: Memory budget for resident models
/// - `preload`: Load the default model before accepting requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_model: String,
    pub cache_dir: Option<PathBuf>,
    pub device: String,
    pub max_loaded_models: usize,
    pub max_model_memory_mb: u32,
    pub preload: bool,
}

/// Audio conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Explicit ffmpeg binary; discovered on the system when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub conversion_timeout_secs: u64,
    /// Whisper only accepts 16kHz input
    pub sample_rate: u32,
}

/// Transcription behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    /// Silence (seconds) between segments that starts a new speaker turn
    pub speaker_gap_seconds: f64,
    /// Value of `speaker_detection` when a request omits it
    pub speaker_detection_default: bool,
    /// Retry decoding at higher temperatures when the greedy pass looks degenerate
    pub temperature_fallback: bool,
}

/// Defaults for the command line client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_upload_mb: 50,
            },
            models: ModelsConfig {
                default_model: ModelSize::default().to_string(),
                cache_dir: None,
                device: "auto".to_string(),
                max_loaded_models: 2,
                max_model_memory_mb: 8192,
                preload: false,
            },
            audio: AudioConfig {
                ffmpeg_path: None,
                conversion_timeout_secs: 30,
                sample_rate: 16000,
            },
            transcription: TranscriptionSettings {
                speaker_gap_seconds: 2.0,
                speaker_detection_default: true,
                temperature_fallback: true,
            },
            client: ClientConfig {
                endpoint: "http://127.0.0.1:8080".to_string(),
                timeout_secs: 120,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// Sections and fields are separated by a double underscore because
    /// field names themselves contain single underscores.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__DEVICE=cuda`: Force the CUDA device
    /// - `APP_MODELS__DEFAULT_MODEL=small`: Change the default model
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        Self::load_with_env("config", env::vars().collect())
    }

    /// Same as [`AppConfig::load`] with an explicit config file stem and
    /// environment snapshot.
    pub fn load_with_env(file_stem: &str, vars: HashMap<String, String>) -> Result<Self> {
        let host = vars.get("HOST").cloned();
        let port = vars.get("PORT").cloned();

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .source(Some(vars)),
            );

        if let Some(host) = host {
            settings = settings.set_override("server.host", host)?;
        }

        if let Some(port) = port {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 and uploads are allowed at all
    /// - The default model names one of the five Whisper sizes
    /// - The device is one of auto, cpu, cuda or metal
    /// - At least one model may be resident
    /// - Timeouts are non-zero
    /// - Audio is resampled to the 16kHz Whisper expects
    /// - The speaker gap is positive
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        self.default_model()?;

        self.models
            .device
            .parse::<crate::device::DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.models.max_loaded_models == 0 {
            return Err(anyhow::anyhow!("Max loaded models must be greater than 0"));
        }

        if self.audio.conversion_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Audio conversion timeout must be greater than 0"));
        }

        if self.audio.sample_rate != 16000 {
            return Err(anyhow::anyhow!(
                "Sample rate must be 16000 for Whisper, got {}",
                self.audio.sample_rate
            ));
        }

        if !(self.transcription.speaker_gap_seconds > 0.0) {
            return Err(anyhow::anyhow!("Speaker gap must be a positive number of seconds"));
        }

        if self.client.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Client timeout must be greater than 0"));
        }

        Ok(())
    }

    /// The configured default model as a typed size.
    pub fn default_model(&self) -> Result<ModelSize> {
        self.models.default_model.parse::<ModelSize>()
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }

    /// Render the effective configuration as TOML (used by `ramble show-config`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
