//! # Audio Decoding Module
//!
//! Turns an uploaded file into the samples Whisper consumes.
//!
//! ## Key Components:
//! - **WAV fast path**: 16kHz WAV uploads are decoded in-process
//! - **ffmpeg conversion**: Everything else is normalised by ffmpeg
//! - **Audio Processor**: PCM parsing, float conversion, downmixing, validation
//!
//! ## Output Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Samples**: 32-bit float in [-1.0, 1.0]

pub mod convert;
pub mod processor;
pub mod wavfile;

use crate::config::AudioConfig;
use crate::error::AppError;
use anyhow::Result;
use processor::AudioProcessor;

/// Whisper's input sample rate.
pub const SAMPLE_RATE: u32 = 16000;

/// Decode an uploaded file to 16kHz mono float samples.
///
/// Empty uploads, and uploads that decode to no audio, are rejected as bad requests.
pub async fn decode_upload(data: &[u8], filename: Option<&str>, cfg: &AudioConfig) -> Result<Vec<f32>> {
    if data.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()).into());
    }

    let samples = match wavfile::decode_wav(data)? {
        Some(samples) => {
            tracing::debug!("Decoded {} WAV samples in-process", samples.len());
            samples
        }
        None => convert_upload(data, filename, cfg).await?,
    };

    let processor = AudioProcessor::new(cfg.sample_rate);
    processor.validate_samples(&samples).map_err(AppError::BadRequest)?;
    tracing::debug!("Upload holds {:.2}s of audio", processor.duration_seconds(&samples));

    Ok(samples)
}

async fn convert_upload(data: &[u8], filename: Option<&str>, cfg: &AudioConfig) -> Result<Vec<f32>> {
    let start = std::time::Instant::now();
    let samples = convert::convert_with_ffmpeg(data, filename, cfg).await?;
    tracing::debug!(
        "ffmpeg converted {} bytes to {} samples in {}ms",
        data.len(),
        samples.len(),
        start.elapsed().as_millis()
    );
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn test_empty_upload_is_bad_request() {
        let cfg = AppConfig::default().audio;
        let err = decode_upload(&[], Some("a.wav"), &cfg).await.unwrap_err();
        assert!(matches!(AppError::from(err), AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_wav_upload_skips_ffmpeg() {
        let mut cfg = AppConfig::default().audio;
        // Would fail if ffmpeg were invoked
        cfg.ffmpeg_path = Some("/definitely/not/here/ffmpeg".into());

        let data = wavfile::tests::wav_bytes(&[0, 8192, -8192, 0], 16000, 1);
        let samples = decode_upload(&data, Some("clip.wav"), &cfg).await.unwrap();
        assert_eq!(samples, vec![0.0, 0.25, -0.25, 0.0]);
    }
}
