//! # Transcription Service
//!
//! Glue between the HTTP layer and the engine: validates the language,
//! runs the engine, labels speakers and shapes the API response.

use crate::error::AppError;
use crate::protocol::{round2, ModelInfo, Task, TranscriptionResponse};
use crate::transcription::decoder::DecodeOptions;
use crate::transcription::engine::{EngineRequest, SpeechEngine};
use crate::transcription::language;
use crate::transcription::model::ModelSize;
use crate::transcription::speakers::assign_speakers;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

/// One decoded upload plus the caller's options.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// 16kHz mono samples
    pub samples: Vec<f32>,
    pub model: ModelSize,
    /// Language code or name; detected when `None`
    pub language: Option<String>,
    pub task: Task,
    pub speaker_detection: bool,
}

#[derive(Clone)]
pub struct TranscriptionService {
    engine: Arc<dyn SpeechEngine>,
    speaker_gap_seconds: f64,
    temperature_fallback: bool,
}

impl TranscriptionService {
    pub fn new(engine: Arc<dyn SpeechEngine>, speaker_gap_seconds: f64, temperature_fallback: bool) -> Self {
        Self {
            engine,
            speaker_gap_seconds,
            temperature_fallback,
        }
    }

    pub fn engine(&self) -> &Arc<dyn SpeechEngine> {
        &self.engine
    }

    pub async fn run(&self, request: TranscriptionRequest) -> Result<TranscriptionResponse> {
        let start_time = Instant::now();

        let language = match request.language.as_deref() {
            Some(input) => Some(
                language::normalize(input)
                    .ok_or_else(|| AppError::ValidationError(format!("Unsupported language '{}'", input.trim())))?
                    .to_string(),
            ),
            None => None,
        };

        let raw = self
            .engine
            .transcribe(EngineRequest {
                samples: request.samples,
                model: request.model,
                options: DecodeOptions {
                    language,
                    task: request.task,
                    temperature_fallback: self.temperature_fallback,
                },
            })
            .await?;

        let (segments, speakers_detected) =
            assign_speakers(&raw.segments, request.speaker_detection, self.speaker_gap_seconds);
        let duration_seconds = segments.last().map(|s| round2(s.end)).unwrap_or(0.0);
        let language = if raw.language.is_empty() {
            "unknown".to_string()
        } else {
            raw.language
        };

        Ok(TranscriptionResponse {
            text: raw.text.trim().to_string(),
            language,
            duration_seconds,
            segments,
            status: "success".to_string(),
            model: format!("whisper-{}", request.model),
            model_info: ModelInfo::from(request.model),
            task: request.task,
            speakers_detected,
            processing_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transcription::decoder::RawSegment;
    use crate::transcription::model::RawTranscript;
    use crate::transcription::registry::ModelRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Engine that replays a canned transcript and remembers the last request.
    pub(crate) struct StubEngine {
        pub transcript: RawTranscript,
        pub last_request: Mutex<Option<EngineRequest>>,
        registry: ModelRegistry,
    }

    impl StubEngine {
        pub(crate) fn new(transcript: RawTranscript) -> Self {
            Self {
                transcript,
                last_request: Mutex::new(None),
                registry: ModelRegistry::new(2, 8192),
            }
        }

        pub(crate) fn conversation() -> Self {
            Self::new(RawTranscript {
                text: " Hello there. Hi! ".to_string(),
                language: "en".to_string(),
                segments: vec![
                    RawSegment {
                        start: 0.0,
                        end: 1.504,
                        text: " Hello there.".to_string(),
                    },
                    RawSegment {
                        start: 4.0,
                        end: 5.256,
                        text: " Hi!".to_string(),
                    },
                ],
            })
        }

        pub(crate) fn last_request(&self) -> Option<EngineRequest> {
            self.last_request.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechEngine for StubEngine {
        async fn transcribe(&self, request: EngineRequest) -> Result<RawTranscript> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(self.transcript.clone())
        }

        async fn ensure_loaded(&self, _size: ModelSize) -> Result<()> {
            Ok(())
        }

        fn registry(&self) -> &ModelRegistry {
            &self.registry
        }

        fn device_name(&self) -> String {
            "cpu".to_string()
        }
    }

    fn request(language: Option<&str>, task: Task, speaker_detection: bool) -> TranscriptionRequest {
        TranscriptionRequest {
            samples: vec![0.0; 16000],
            model: ModelSize::Base,
            language: language.map(str::to_string),
            task,
            speaker_detection,
        }
    }

    #[tokio::test]
    async fn test_run_builds_response() {
        let engine = Arc::new(StubEngine::conversation());
        let service = TranscriptionService::new(engine.clone(), 2.0, true);

        let response = service.run(request(None, Task::Transcribe, true)).await.unwrap();
        assert_eq!(response.text, "Hello there. Hi!");
        assert_eq!(response.language, "en");
        assert_eq!(response.status, "success");
        assert_eq!(response.model, "whisper-base");
        assert_eq!(response.model_info.name, "base");
        assert_eq!(response.duration_seconds, 5.26);
        assert_eq!(response.speakers_detected, 2);
        assert_eq!(response.segments[1].speaker, "Speaker 2");
        assert_eq!(response.segments[0].end, 1.5);

        let sent = engine.last_request().unwrap();
        assert_eq!(sent.options.language, None);
        assert!(sent.options.temperature_fallback);
    }

    #[tokio::test]
    async fn test_language_is_normalized() {
        let engine = Arc::new(StubEngine::conversation());
        let service = TranscriptionService::new(engine.clone(), 2.0, false);

        service.run(request(Some("German"), Task::Translate, false)).await.unwrap();
        let sent = engine.last_request().unwrap();
        assert_eq!(sent.options.language.as_deref(), Some("de"));
        assert_eq!(sent.options.task, Task::Translate);
        assert!(!sent.options.temperature_fallback);
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected() {
        let engine = Arc::new(StubEngine::conversation());
        let service = TranscriptionService::new(engine.clone(), 2.0, true);

        let err = service.run(request(Some("klingon"), Task::Transcribe, true)).await.unwrap_err();
        assert!(matches!(AppError::from(err), AppError::ValidationError(_)));
        assert!(engine.last_request().is_none());
    }

    #[tokio::test]
    async fn test_empty_transcript() {
        let engine = Arc::new(StubEngine::new(RawTranscript::default()));
        let service = TranscriptionService::new(engine, 2.0, true);

        let response = service.run(request(None, Task::Transcribe, false)).await.unwrap();
        assert_eq!(response.text, "");
        assert_eq!(response.language, "unknown");
        assert_eq!(response.duration_seconds, 0.0);
        assert!(response.segments.is_empty());
        assert_eq!(response.speakers_detected, 1);
    }
}
