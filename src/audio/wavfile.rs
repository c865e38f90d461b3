//! WAV fast path.
//!
//! Uploads that are already 16kHz WAV are decoded in-process with the `wav`
//! crate. Anything else (other rates, other containers) goes through ffmpeg.

use crate::audio::processor::AudioProcessor;
use crate::audio::SAMPLE_RATE;
use anyhow::{anyhow, Result};
use std::io::Cursor;
use wav::BitDepth;

/// Cheap container sniff: `RIFF....WAVE`.
pub fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

/// Decode a 16kHz WAV upload to mono float samples.
///
/// Returns `Ok(None)` when the data is not a WAV at 16kHz, so the caller can
/// fall back to ffmpeg; returns an error when it is one but cannot be read.
pub fn decode_wav(data: &[u8]) -> Result<Option<Vec<f32>>> {
    if !is_wav(data) {
        return Ok(None);
    }

    let (header, track) = match wav::read(&mut Cursor::new(data)) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("WAV fast path failed ({}), falling back to ffmpeg", e);
            return Ok(None);
        }
    };

    if header.sampling_rate != SAMPLE_RATE {
        tracing::debug!(
            "WAV is {} Hz, resampling with ffmpeg",
            header.sampling_rate
        );
        return Ok(None);
    }

    let channels = header.channel_count.max(1) as usize;
    let processor = AudioProcessor::default();

    let interleaved: Vec<f32> = match track {
        BitDepth::Eight(samples) => samples
            .iter()
            .map(|&s| (s as f32 - 128.0) / 128.0)
            .collect(),
        BitDepth::Sixteen(samples) => processor.pcm_to_float(&samples),
        BitDepth::TwentyFour(samples) => samples
            .iter()
            .map(|&s| s as f32 / 8_388_608.0)
            .collect(),
        BitDepth::ThirtyTwoFloat(samples) => samples,
        BitDepth::Empty => return Err(anyhow!("WAV file contains no audio data")),
    };

    Ok(Some(processor.downmix_to_mono(&interleaved, channels)))
}
