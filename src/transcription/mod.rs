//! # Transcription Module
//!
//! Speech-to-text with Whisper models running in-process on the Candle-rs framework.
//!
//! ## Key Components:
//! - **Model Management**: Fetching weights from HuggingFace and building the model
//! - **Decoding**: Mel features, language detection, timestamped greedy decoding
//! - **Transcription Engine**: Lazy loading, LRU residency and inference off the async runtime
//! - **Model Registry**: Status and performance metrics per model size
//! - **Service**: Turns engine output into the API response
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39M parameters, fastest but least accurate
//! - **base**: ~74M, the default
//! - **small**: ~244M, better accuracy
//! - **medium**: ~769M, good technical vocabulary
//! - **large**: ~1550M (large-v2), best accuracy but slowest

pub mod decoder;     // Token-level decoding loop
pub mod downloader;  // Cache warm-up for all sizes
pub mod engine;      // Model residency and inference
pub mod language;    // Whisper language table
pub mod mel;         // Log-mel spectrogram front-end
pub mod model;       // Model files and the candle model
pub mod registry;    // Model status and metrics
pub mod service;     // Request orchestration
pub mod speakers;    // Pause-based speaker labels

pub use engine::{SpeechEngine, WhisperEngine};
pub use model::ModelSize;
pub use service::TranscriptionService;
