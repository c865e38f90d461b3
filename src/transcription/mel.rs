//! # Mel Spectrogram Front-End
//!
//! Whisper consumes log-mel spectrograms computed with a 400-point FFT, a
//! 160-sample hop and 80 (or 128 for large-v3) mel bins. The filterbank is
//! the librosa default: Slaney mel scale with Slaney area normalisation.
//! The STFT and log compression come from candle's Whisper audio module.

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use candle_transformers::models::whisper::{self as m, Config};

/// Number of FFT bins for a 400-point real FFT.
pub const N_FREQS: usize = m::N_FFT / 2 + 1;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn logstep() -> f64 {
    6.4f64.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / F_SP
    } else {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / logstep()
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * (logstep() * (mel - MIN_LOG_MEL)).exp()
    }
}

/// Build the `[n_mels][N_FREQS]` filterbank, flattened row-major.
///
/// Each triangle spans three consecutive mel points and is scaled by
/// `2 / (f_right - f_left)` so every filter has roughly constant energy.
pub fn mel_filters(n_mels: usize) -> Vec<f32> {
    let sample_rate = m::SAMPLE_RATE as f64;
    let f_max = sample_rate / 2.0;

    let fft_freqs: Vec<f64> = (0..N_FREQS)
        .map(|k| k as f64 * sample_rate / m::N_FFT as f64)
        .collect();

    let mel_max = hz_to_mel(f_max);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * N_FREQS];
    for i in 0..n_mels {
        let (left, center, right) = (mel_points[i], mel_points[i + 1], mel_points[i + 2]);
        let enorm = 2.0 / (right - left);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[i * N_FREQS + k] = (weight * enorm) as f32;
        }
    }

    filters
}

/// Compute the log-mel spectrogram of 16kHz mono samples.
///
/// Returns a `(1, n_mels, frames)` tensor. candle pads the tail with
/// silence, so `frames` is larger than `samples.len() / HOP_LENGTH`.
pub fn log_mel(config: &Config, samples: &[f32], filters: &[f32], device: &Device) -> Result<Tensor> {
    let n_mels = config.num_mel_bins;
    if filters.len() != n_mels * N_FREQS {
        return Err(anyhow!(
            "Mel filterbank has {} weights, expected {} for {} bins",
            filters.len(),
            n_mels * N_FREQS,
            n_mels
        ));
    }

    let mel = m::audio::pcm_to_mel(config, samples, filters);
    let frames = mel.len() / n_mels;
    Ok(Tensor::from_vec(mel, (1, n_mels, frames), device)?)
}

/// Number of mel frames that contain real audio (as opposed to padding).
pub fn content_frames(sample_count: usize) -> usize {
    sample_count / m::HOP_LENGTH
}
