//! Wire types shared by the HTTP handlers and the command line client.

use crate::transcription::model::ModelSize;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do with the speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Text in the spoken language
    #[default]
    Transcribe,
    /// English text regardless of the spoken language
    Translate,
}

impl std::str::FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(format!(
                "Invalid task '{}'. Choose from: transcribe, translate",
                other
            )),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Transcribe => write!(f, "transcribe"),
            Task::Translate => write!(f, "translate"),
        }
    }
}

/// One labelled stretch of speech. Times are seconds, rounded to 2 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub speaker: String,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Catalogue row describing one model size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub speed: String,
    pub accuracy: String,
    pub vram: String,
    pub size_mb: u32,
    pub repo: String,
}

impl From<ModelSize> for ModelInfo {
    fn from(size: ModelSize) -> Self {
        Self {
            name: size.to_string(),
            speed: size.speed().to_string(),
            accuracy: size.accuracy().to_string(),
            vram: size.vram().to_string(),
            size_mb: size.size_mb(),
            repo: size.repo_name().to_string(),
        }
    }
}

/// Successful `/transcribe` or `/translate` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: String,
    pub duration_seconds: f64,
    pub segments: Vec<Segment>,
    pub status: String,
    /// `whisper-<size>`
    pub model: String,
    pub model_info: ModelInfo,
    pub task: Task,
    pub speakers_detected: usize,
    pub processing_time_ms: u64,
}

/// Round to two decimals the way every time in a response is reported.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
