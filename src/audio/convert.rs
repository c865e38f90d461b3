//! # ffmpeg Conversion
//!
//! Any container or codec ffmpeg understands is normalised to 16kHz mono
//! signed 16-bit PCM, streamed back on stdout:
//!
//! ```text
//! ffmpeg -i <upload> -ar 16000 -ac 1 -f s16le -acodec pcm_s16le pipe:1
//! ```
//!
//! The upload is written to a temporary file first because several
//! containers (mp4/m4a) need a seekable input.

use crate::audio::processor::AudioProcessor;
use crate::config::AudioConfig;
use crate::error::AppError;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Suffix for the temporary input file, taken from the uploaded filename.
///
/// ffmpeg probes content rather than extensions, but a plausible suffix
/// helps it with raw streams. Defaults to `.ogg` (what voice recorders send).
pub fn temp_suffix(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_else(|| ".ogg".to_string())
}

/// Locates the ffmpeg binary on the system.
///
/// Checks the configured path, then standard installation locations,
/// then falls back to a PATH search via `which`/`where`.
pub async fn find_ffmpeg(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(anyhow!("Configured ffmpeg not found at {}", path.display()));
    }

    let candidates: Vec<PathBuf> = if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/usr/bin/ffmpeg"),
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/snap/bin/ffmpeg"),
        ]
    } else {
        vec![]
    };

    if let Some(path) = candidates.into_iter().find(|path| path.exists()) {
        tracing::debug!("Found ffmpeg at: {}", path.display());
        return Ok(path);
    }

    let search_cmd = if cfg!(target_os = "windows") { "where" } else { "which" };
    let output = Command::new(search_cmd)
        .arg("ffmpeg")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to search PATH for ffmpeg: {}", e))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(first) = stdout.lines().next().map(str::trim).filter(|l| !l.is_empty()) {
            return Ok(PathBuf::from(first));
        }
    }

    Err(anyhow!(
        "ffmpeg not found. Install it (apt install ffmpeg / brew install ffmpeg) or set audio.ffmpeg_path"
    ))
}

/// Convert an upload of any format to 16kHz mono float samples with ffmpeg.
///
/// ## Errors:
/// - ffmpeg exits non-zero → `AudioConversion` carrying ffmpeg's stderr
/// - ffmpeg runs longer than `conversion_timeout_secs` → `Timeout`
/// - ffmpeg is missing → `Internal`
pub async fn convert_with_ffmpeg(data: &[u8], filename: Option<&str>, cfg: &AudioConfig) -> Result<Vec<f32>> {
    let ffmpeg = find_ffmpeg(cfg.ffmpeg_path.as_deref())
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    // Removed when `input` drops, on every path out of this function
    let input = tempfile::Builder::new()
        .prefix("ramble-upload-")
        .suffix(&temp_suffix(filename))
        .tempfile()?;
    tokio::fs::write(input.path(), data).await?;

    let mut command = Command::new(&ffmpeg);
    command
        .arg("-nostdin")
        .arg("-hide_banner")
        .arg("-i")
        .arg(input.path())
        .args(["-ar", &cfg.sample_rate.to_string()])
        .args(["-ac", "1"])
        .args(["-f", "s16le"])
        .args(["-acodec", "pcm_s16le"])
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("Running {:?}", command.as_std());
    let child = command
        .spawn()
        .map_err(|e| AppError::Internal(format!("Failed to start ffmpeg: {}", e)))?;

    let timeout = Duration::from_secs(cfg.conversion_timeout_secs);
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            tracing::warn!("ffmpeg exceeded {}s on a {} byte upload", cfg.conversion_timeout_secs, data.len());
            return Err(AppError::Timeout("Audio processing timed out (file too large?)".to_string()).into());
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("unknown error")
            .trim()
            .to_string();
        return Err(AppError::AudioConversion(format!("Audio conversion failed: {}", detail)).into());
    }

    let processor = AudioProcessor::new(cfg.sample_rate);
    let samples = processor.parse_pcm_s16le(&output.stdout);
    Ok(processor.pcm_to_float(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_suffix() {
        assert_eq!(temp_suffix(Some("meeting.MP3")), ".mp3");
        assert_eq!(temp_suffix(Some("voice.note.m4a")), ".m4a");
        assert_eq!(temp_suffix(Some("recording")), ".ogg");
        assert_eq!(temp_suffix(Some("weird.a b")), ".ogg");
        assert_eq!(temp_suffix(None), ".ogg");
    }

    #[tokio::test]
    async fn test_configured_ffmpeg_must_exist() {
        let missing = Path::new("/definitely/not/here/ffmpeg");
        assert!(find_ffmpeg(Some(missing)).await.is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(find_ffmpeg(Some(file.path())).await.unwrap(), file.path());
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_internal_error() {
        let cfg = AudioConfig {
            ffmpeg_path: Some(PathBuf::from("/definitely/not/here/ffmpeg")),
            conversion_timeout_secs: 5,
            sample_rate: 16000,
        };
        let err = convert_with_ffmpeg(b"OggS", Some("a.ogg"), &cfg).await.unwrap_err();
        let app: AppError = err.into();
        assert!(matches!(app, AppError::Internal(_)));
    }

    /// An executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_failure_is_conversion_error() {
        use actix_web::ResponseError;

        let dir = tempfile::tempdir().unwrap();
        let cfg = AudioConfig {
            ffmpeg_path: Some(fake_ffmpeg(
                &dir,
                "echo 'some banner' >&2\necho 'Invalid data found when processing input' >&2\nexit 1",
            )),
            conversion_timeout_secs: 10,
            sample_rate: 16000,
        };

        let err = convert_with_ffmpeg(b"not audio", Some("clip.mp3"), &cfg).await.unwrap_err();
        let app: AppError = err.into();
        assert!(matches!(
            &app,
            AppError::AudioConversion(msg) if msg == "Audio conversion failed: Invalid data found when processing input"
        ));
        assert_eq!(app.status_code().as_u16(), 400);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_ffmpeg_times_out() {
        use actix_web::ResponseError;

        let dir = tempfile::tempdir().unwrap();
        let cfg = AudioConfig {
            ffmpeg_path: Some(fake_ffmpeg(&dir, "exec sleep 10")),
            conversion_timeout_secs: 1,
            sample_rate: 16000,
        };

        let started = std::time::Instant::now();
        let err = convert_with_ffmpeg(b"OggS", Some("clip.ogg"), &cfg).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));

        let app: AppError = err.into();
        assert!(matches!(app, AppError::Timeout(_)));
        assert_eq!(app.status_code().as_u16(), 408);
    }
}
