//! # Command Line Client
//!
//! `ramble transcribe <file>` uploads a file to a running Ramble server and
//! pretty-prints the result.

use crate::protocol::TranscriptionResponse;
use anyhow::{anyhow, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the server to talk to.
pub const ENDPOINT_ENV: &str = "RAMBLE_ENDPOINT";

/// Options for one upload.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: String,
    pub language: Option<String>,
    pub model: Option<String>,
    /// Use `/translate` instead of `/transcribe`
    pub translate: bool,
    /// `None` leaves the server default
    pub speaker_detection: Option<bool>,
    pub timeout: Duration,
}

/// Pick the endpoint: `--endpoint`, then `RAMBLE_ENDPOINT`, then the config file.
pub fn resolve_endpoint(flag: Option<&str>, env_value: Option<&str>, configured: &str) -> String {
    flag.or(env_value)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(configured)
        .trim_end_matches('/')
        .to_string()
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "m4a" | "mp4" => "audio/mp4",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Upload `path` and return the parsed response.
///
/// Non-2xx responses become errors carrying the server's `error` message.
pub async fn transcribe_file(path: &Path, options: &ClientOptions) -> Result<TranscriptionResponse> {
    if !path.exists() {
        return Err(anyhow!("File not found: {}", path.display()));
    }
    let audio_data = tokio::fs::read(path)
        .await
        .map_err(|e| anyhow!("Failed to read audio file: {e}"))?;

    let file_name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let file_part = reqwest::multipart::Part::bytes(audio_data)
        .file_name(file_name)
        .mime_str(mime_for(path))
        .map_err(|e| anyhow!("Failed to create file part for upload: {e}"))?;

    let mut form = reqwest::multipart::Form::new().part("file", file_part);
    let route = if options.translate {
        if let Some(language) = &options.language {
            form = form.text("source_language", language.clone());
        }
        "translate"
    } else {
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }
        if let Some(model) = &options.model {
            form = form.text("model", model.clone());
        }
        if let Some(speakers) = options.speaker_detection {
            form = form.text("speaker_detection", speakers.to_string());
        }
        "transcribe"
    };

    let url = format!("{}/{}", options.endpoint, route);
    tracing::debug!("POST {} ({})", url, path.display());

    let client = reqwest::Client::builder()
        .timeout(options.timeout)
        .build()
        .map_err(|e| anyhow!("Failed to build HTTP client: {e}"))?;

    let response = match client.post(&url).multipart(form).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let error_msg = if e.is_connect() {
                format!("Failed to connect to {}. Is `ramble serve` running?", options.endpoint)
            } else if e.is_timeout() {
                format!("Request timed out after {}s", options.timeout.as_secs())
            } else {
                format!("Request failed: {e}")
            };
            return Err(anyhow!(error_msg));
        }
    };

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        return Err(anyhow!(
            "Server returned {}: {}",
            status,
            server_error_message(&error_body)
        ));
    }

    response
        .json::<TranscriptionResponse>()
        .await
        .map_err(|e| anyhow!("Failed to parse server response: {e}"))
}

/// The `error` field of an error body, or the raw body when it is not JSON.
fn server_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Render a result the way `ramble transcribe` prints it.
pub fn format_transcription(result: &TranscriptionResponse, show_segments: bool) -> String {
    let rule = "=".repeat(60);
    let mut out = String::new();

    let _ = writeln!(out, "\n{rule}");
    let _ = writeln!(out, "TRANSCRIPTION RESULT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "\nText:\n{}", result.text);
    let _ = writeln!(out, "\nLanguage: {}", result.language);
    let _ = writeln!(out, "Duration: {}s", result.duration_seconds);
    let _ = writeln!(out, "Model: {}", result.model);
    let _ = writeln!(out, "Task: {}", result.task);

    if show_segments && !result.segments.is_empty() {
        let _ = writeln!(out, "\nSegments ({}):", result.segments.len());
        let _ = writeln!(out, "{}", "-".repeat(60));
        for seg in &result.segments {
            let _ = writeln!(
                out,
                "[{:6.2}s - {:6.2}s] {}: {}",
                seg.start, seg.end, seg.speaker, seg.text
            );
        }
    }

    let _ = write!(out, "{rule}");
    out
}

pub fn print_transcription(result: &TranscriptionResponse, show_segments: bool) {
    println!("{}", format_transcription(result, show_segments));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ModelInfo, Segment, Task};
    use crate::transcription::model::ModelSize;

    fn response() -> TranscriptionResponse {
        TranscriptionResponse {
            text: "Hello there. Hi!".to_string(),
            language: "en".to_string(),
            duration_seconds: 5.26,
            segments: vec![
                Segment {
                    speaker: "Speaker 1".to_string(),
                    text: "Hello there.".to_string(),
                    start: 0.0,
                    end: 1.5,
                },
                Segment {
                    speaker: "Speaker 2".to_string(),
                    text: "Hi!".to_string(),
                    start: 4.0,
                    end: 5.26,
                },
            ],
            status: "success".to_string(),
            model: "whisper-base".to_string(),
            model_info: ModelInfo::from(ModelSize::Base),
            task: Task::Transcribe,
            speakers_detected: 2,
            processing_time_ms: 42,
        }
    }

    #[test]
    fn test_resolve_endpoint() {
        let configured = "http://127.0.0.1:8080";
        assert_eq!(resolve_endpoint(Some("http://a:1/"), Some("http://b:2"), configured), "http://a:1");
        assert_eq!(resolve_endpoint(None, Some("http://b:2"), configured), "http://b:2");
        assert_eq!(resolve_endpoint(None, Some("  "), configured), configured);
        assert_eq!(resolve_endpoint(None, None, configured), configured);
    }

    #[test]
    fn test_format_transcription() {
        let plain = format_transcription(&response(), false);
        assert!(plain.contains("Text:\nHello there. Hi!"));
        assert!(plain.contains("Language: en"));
        assert!(plain.contains("Duration: 5.26s"));
        assert!(plain.contains("Model: whisper-base"));
        assert!(!plain.contains("Segments"));

        let detailed = format_transcription(&response(), true);
        assert!(detailed.contains("Segments (2):"));
        assert!(detailed.contains("[  0.00s -   1.50s] Speaker 1: Hello there."));
        assert!(detailed.contains("[  4.00s -   5.26s] Speaker 2: Hi!"));
    }

    #[test]
    fn test_server_error_message() {
        let body = r#"{"text":"","status":"error","error":"Invalid model 'x'","type":"bad_request"}"#;
        assert_eq!(server_error_message(body), "Invalid model 'x'");
        assert_eq!(server_error_message("Bad gateway\n"), "Bad gateway");
    }

    #[test]
    fn test_response_round_trips_through_json() {
        let json = serde_json::to_string(&response()).unwrap();
        let parsed: TranscriptionResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.segments, response().segments);
        assert_eq!(parsed.task, Task::Transcribe);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let options = ClientOptions {
            endpoint: "http://127.0.0.1:9".to_string(),
            language: None,
            model: None,
            translate: false,
            speaker_detection: None,
            timeout: Duration::from_secs(1),
        };
        let err = transcribe_file(Path::new("/no/such/recording.ogg"), &options)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for(Path::new("voice.ogg")), "audio/ogg");
        assert_eq!(mime_for(Path::new("blob")), "application/octet-stream");
    }
}
