//! # Transcription REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /transcribe` - Transcribe an uploaded audio file
//! - `POST /translate` - Translate an uploaded audio file to English
//!
//! ## Request:
//! Multipart form data. The audio goes in a field named `file`; the other
//! fields are plain text:
//!
//! | field               | endpoint   | default                |
//! |---------------------|------------|------------------------|
//! | `model`             | transcribe | configured default     |
//! | `language`          | both       | detected               |
//! | `source_language`   | translate  | detected               |
//! | `task`              | transcribe | `transcribe`           |
//! | `speaker_detection` | transcribe | configured default     |

use crate::audio;
use crate::error::{AppError, AppResult};
use crate::protocol::Task;
use crate::state::{ActiveTranscription, AppState};
use crate::transcription::model::ModelSize;
use crate::transcription::service::TranscriptionRequest;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use std::collections::HashMap;

/// Text fields longer than this are rejected.
const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// Text fields the handlers read. Other parts are drained and dropped.
const FORM_FIELDS: &[&str] = &["model", "language", "source_language", "task", "speaker_detection"];

/// A parsed upload form.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file: Option<Vec<u8>>,
    pub filename: Option<String>,
    /// Known text fields, by name
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    /// A text field, `None` when missing or blank.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Bytes received across every part of one form.
#[derive(Debug)]
struct UploadBudget {
    used: usize,
    limit: usize,
}

impl UploadBudget {
    fn new(limit: usize) -> Self {
        Self { used: 0, limit }
    }

    fn charge(&mut self, bytes: usize) -> AppResult<()> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(AppError::PayloadTooLarge(format!(
                "Upload too large (max: {} MB)",
                self.limit / (1024 * 1024)
            )));
        }
        Ok(())
    }
}

/// Read the whole multipart form, enforcing the upload limit while streaming.
///
/// `max_upload_bytes` covers every part, so padding the form with extra
/// fields cannot get around it.
pub async fn read_upload_form(mut payload: Multipart, max_upload_bytes: usize) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();
    let mut budget = UploadBudget::new(max_upload_bytes);

    while let Some(item) = payload.next().await {
        let mut field: Field = item?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::ValidationError("Missing content disposition".to_string())
        })?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        if field_name == "file" {
            form.filename = content_disposition.get_filename().map(|s| s.to_string());

            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = chunk?;
                budget.charge(chunk.len())?;
                bytes.extend_from_slice(&chunk);
            }
            form.file = Some(bytes);
        } else if FORM_FIELDS.contains(&field_name.as_str()) {
            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = chunk?;
                budget.charge(chunk.len())?;
                if bytes.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
                    return Err(AppError::ValidationError(format!("Field '{}' is too long", field_name)));
                }
                bytes.extend_from_slice(&chunk);
            }
            let value = String::from_utf8(bytes)
                .map_err(|_| AppError::ValidationError(format!("Field '{}' is not valid UTF-8", field_name)))?;
            form.fields.insert(field_name, value);
        } else {
            tracing::debug!("Ignoring unknown form field '{}'", field_name);
            while let Some(chunk) = field.next().await {
                budget.charge(chunk?.len())?;
            }
        }
    }

    Ok(form)
}

/// Parse a form boolean the way HTML forms and curl users send them.
pub fn parse_form_bool(name: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(AppError::ValidationError(format!(
            "Invalid value '{}' for {}. Use true or false",
            other, name
        ))),
    }
}

fn take_file(form: &mut UploadForm) -> Result<Vec<u8>, AppError> {
    form.file
        .take()
        .ok_or_else(|| AppError::BadRequest("No audio file provided (expected multipart field 'file')".to_string()))
}

/// Decode the upload and run it through the service.
async fn run_transcription(
    state: &AppState,
    bytes: Vec<u8>,
    filename: Option<String>,
    model: ModelSize,
    language: Option<String>,
    task: Task,
    speaker_detection: bool,
) -> AppResult<HttpResponse> {
    let _active = ActiveTranscription::start(state);

    tracing::info!(
        "{} request: {} bytes ({}), model {}, language {}, speakers {}",
        task,
        bytes.len(),
        filename.as_deref().unwrap_or("unnamed"),
        model,
        language.as_deref().unwrap_or("auto"),
        speaker_detection
    );

    let samples = audio::decode_upload(&bytes, filename.as_deref(), &state.config.audio).await?;
    drop(bytes);

    let response = state
        .service
        .run(TranscriptionRequest {
            samples,
            model,
            language,
            task,
            speaker_detection,
        })
        .await?;

    tracing::info!(
        "Transcribed {:.2}s of audio with whisper-{} in {}ms ({} segments)",
        response.duration_seconds,
        model,
        response.processing_time_ms,
        response.segments.len()
    );

    Ok(HttpResponse::Ok().json(response))
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /transcribe`
///
/// ## Response:
/// ```json
/// {
///   "text": "Hello there. Hi!",
///   "language": "en",
///   "duration_seconds": 5.26,
///   "segments": [
///     {"speaker": "Speaker 1", "text": "Hello there.", "start": 0.0, "end": 1.5}
///   ],
///   "status": "success",
///   "model": "whisper-base",
///   "model_info": {"name": "base", "speed": "fast", "accuracy": "good", "vram": "1GB", ...},
///   "task": "transcribe",
///   "speakers_detected": 1,
///   "processing_time_ms": 812
/// }
/// ```
pub async fn transcribe(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = &state.config;
    let mut form = read_upload_form(payload, config.max_upload_bytes()).await?;

    let model = match form.text("model") {
        Some(name) => name
            .parse::<ModelSize>()
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => config.default_model()?,
    };
    let task = match form.text("task") {
        Some(task) => task.parse::<Task>().map_err(AppError::BadRequest)?,
        None => Task::Transcribe,
    };
    let speaker_detection = match form.text("speaker_detection") {
        Some(value) => parse_form_bool("speaker_detection", value)?,
        None => config.transcription.speaker_detection_default,
    };
    let language = form.text("language").map(str::to_string);
    let bytes = take_file(&mut form)?;

    run_transcription(&state, bytes, form.filename.take(), model, language, task, speaker_detection).await
}

/// Translate an uploaded audio file to English.
///
/// ## Endpoint: `POST /translate`
///
/// Always uses the default model with speaker detection off.
pub async fn translate(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let config = &state.config;
    let mut form = read_upload_form(payload, config.max_upload_bytes()).await?;

    let language = form
        .text("source_language")
        .or_else(|| form.text("language"))
        .map(str::to_string);
    let model = config.default_model()?;
    let bytes = take_file(&mut form)?;

    run_transcription(&state, bytes, form.filename.take(), model, language, Task::Translate, false).await
}
