//! # Audio Sample Conversion
//!
//! Turns the raw PCM that ffmpeg or a WAV file hands us into the 32-bit float,
//! mono, 16kHz samples the Whisper front-end expects.
//!
//! ## Key Functions:
//! - **PCM parsing**: Little-endian 16-bit bytes to samples
//! - **Format conversion**: Integer PCM to floats in [-1.0, 1.0]
//! - **Channel mixing**: Interleaved multi-channel audio to mono
//! - **Validation**: Reject empty or non-finite audio before inference

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Audio conversion and validation utilities.
pub struct AudioProcessor {
    sample_rate: u32,
}

impl AudioProcessor {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Parse raw `s16le` bytes (ffmpeg's `-f s16le` output).
    ///
    /// A trailing odd byte is ignored.
    pub fn parse_pcm_s16le(&self, data: &[u8]) -> Vec<i16> {
        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        samples
    }

    /// Convert 16-bit PCM samples to 32-bit float format for ML models.
    ///
    /// ## Conversion:
    /// Scales from 16-bit integer range [-32768, 32767] to float range [-1.0, 1.0]
    pub fn pcm_to_float(&self, samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
    }

    /// Average interleaved channels into a single channel.
    pub fn downmix_to_mono(&self, samples: &[f32], channels: usize) -> Vec<f32> {
        if channels <= 1 {
            return samples.to_vec();
        }
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Check samples are usable for transcription.
    pub fn validate_samples(&self, samples: &[f32]) -> Result<(), String> {
        if samples.is_empty() {
            return Err("Audio contains no samples".to_string());
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err("Audio contains invalid (non-finite) samples".to_string());
        }
        Ok(())
    }

    pub fn duration_seconds(&self, samples: &[f32]) -> f64 {
        samples.len() as f64 / self.sample_rate as f64
    }
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new(crate::audio::SAMPLE_RATE)
    }
}
