//! # Error Handling
//!
//! This module defines the service's error types and how they're converted to HTTP responses.
//!
//! ## Layers:
//! - The audio, transcription and client layers return `anyhow::Result`
//! - Handlers return [`AppResult`], and `AppError` renders itself as JSON
//!   through actix's `ResponseError` trait
//!
//! Every error body has the same shape, so callers that only look at
//! `text` and `status` keep working when a request fails:
//!
//! ```json
//! {
//!   "text": "",
//!   "status": "error",
//!   "error": "Invalid model 'huge'. Choose from: tiny, base, small, medium, large",
//!   "type": "bad_request",
//!   "timestamp": "2025-01-01T12:00:00Z"
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **ValidationError**: A form field failed validation (400)
/// - **AudioConversion**: ffmpeg could not decode the upload (400)
/// - **Timeout**: Audio conversion took too long (408)
/// - **PayloadTooLarge**: Upload exceeds `server.max_upload_mb` (413)
/// - **ModelUnavailable**: The Whisper model could not be fetched or loaded (503)
/// - **NotFound**: Requested resource doesn't exist (404)
/// - **ConfigError**: Configuration problems (500)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ValidationError(String),
    AudioConversion(String),
    Timeout(String),
    PayloadTooLarge(String),
    ModelUnavailable(String),
    NotFound(String),
    ConfigError(String),
}

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub text: String,
    pub status: String,
    pub error: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub timestamp: String,
}

impl AppError {
    /// Machine-readable kind, used as the `type` field of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ValidationError(_) => "validation_error",
            AppError::AudioConversion(_) => "audio_conversion_error",
            AppError::Timeout(_) => "timeout",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::ModelUnavailable(_) => "model_unavailable",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// The message without the category prefix that `Display` adds.
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ValidationError(msg)
            | AppError::AudioConversion(msg)
            | AppError::Timeout(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::ModelUnavailable(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg) => msg,
        }
    }

    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            text: String::new(),
            status: "error".to_string(),
            error: self.message().to_string(),
            error_type: self.kind().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::AudioConversion(msg) => write!(f, "Audio conversion error: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::ModelUnavailable(msg) => write!(f, "Model unavailable: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/ValidationError/AudioConversion → 400
/// - NotFound → 404
/// - Timeout → 408
/// - PayloadTooLarge → 413
/// - Internal/ConfigError → 500
/// - ModelUnavailable → 503
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::ValidationError(_)
            | AppError::AudioConversion(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_body())
    }
}

/// Errors that already carry an `AppError` (for example from the audio
/// layer) keep their category; everything else becomes a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_error) => app_error,
            Err(err) => AppError::Internal(format!("{:#}", err)),
        }
    }
}

/// JSON parsing errors are almost always the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// A broken or truncated multipart body.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Invalid multipart form: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
