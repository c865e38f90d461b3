//! # Whisper Decoding
//!
//! Turns a log-mel spectrogram into timestamped text with a loaded Whisper model.
//!
//! ## Decoding Process:
//! 1. Detect the spoken language from the first 30s window (unless the caller supplied one)
//! 2. Walk the spectrogram in 30s windows ("seek" loop)
//! 3. Encode each window once, then decode greedily with temperature fallback
//! 4. Skip windows the model considers silent
//! 5. Split the generated tokens into segments at timestamp tokens
//!
//! Logit filtering (suppressed tokens and the timestamp pairing rules)
//! works on plain `Vec<f32>` logits so it can be tested without a model.

use crate::protocol::Task;
use crate::transcription::language;
use anyhow::{anyhow, Result};
use candle_core::{IndexOp, Tensor};
use candle_transformers::models::whisper::{self as m, Config};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokenizers::Tokenizer;

/// Timestamp tokens advance in 20ms steps.
const TIMESTAMPS_PER_SECOND: f64 = 50.0;

/// The first timestamp of a window may not exceed one second.
const MAX_INITIAL_TIMESTAMP_STEPS: u32 = 50;

/// What the caller wants decoded.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Language code ("en", "de", ...); detected when `None`
    pub language: Option<String>,
    pub task: Task,
    /// Retry at higher temperatures when a greedy pass looks degenerate
    pub temperature_fallback: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            language: None,
            task: Task::Transcribe,
            temperature_fallback: true,
        }
    }
}

/// Special token ids looked up in the tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct SpecialTokens {
    pub sot: u32,
    pub eot: u32,
    pub transcribe: u32,
    pub translate: u32,
    pub no_timestamps: u32,
    pub no_speech: Option<u32>,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no '{}' token", token))
        };

        Ok(Self {
            sot: lookup(m::SOT_TOKEN)?,
            eot: lookup(m::EOT_TOKEN)?,
            transcribe: lookup(m::TRANSCRIBE_TOKEN)?,
            translate: lookup(m::TRANSLATE_TOKEN)?,
            no_timestamps: lookup(m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        })
    }

    /// Id of `<|0.00|>`; every id from here up is a timestamp.
    pub fn timestamp_begin(&self) -> u32 {
        self.no_timestamps + 1
    }
}

/// Result of decoding one 30s window at one temperature.
#[derive(Debug, Clone)]
pub struct DecodingResult {
    pub tokens: Vec<u32>,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
    pub compression_ratio: f64,
}

impl DecodingResult {
    fn needs_fallback(&self) -> bool {
        self.compression_ratio > m::COMPRESSION_RATIO_THRESHOLD || self.avg_logprob < m::LOGPROB_THRESHOLD
    }

    fn is_silence(&self) -> bool {
        self.no_speech_prob > m::NO_SPEECH_THRESHOLD && self.avg_logprob < m::LOGPROB_THRESHOLD
    }
}

/// A decoded segment with absolute times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Tokens between two timestamps, with times relative to the window start.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub start: f64,
    /// `None` when the model never closed the span
    pub end: Option<f64>,
    pub tokens: Vec<u32>,
}

pub struct Decoder<'a> {
    model: &'a mut m::model::Whisper,
    tokenizer: &'a Tokenizer,
    config: &'a Config,
    special: SpecialTokens,
    suppress: Vec<bool>,
    language_token: Option<u32>,
    task: Task,
    temperature_fallback: bool,
    rng: StdRng,
}

impl<'a> Decoder<'a> {
    pub fn new(
        model: &'a mut m::model::Whisper,
        tokenizer: &'a Tokenizer,
        config: &'a Config,
        options: &DecodeOptions,
        seed: u64,
    ) -> Result<Self> {
        let special = SpecialTokens::from_tokenizer(tokenizer)?;

        let mut suppress = vec![false; config.vocab_size];
        let always = [
            special.sot,
            special.transcribe,
            special.translate,
            special.no_timestamps,
        ];
        for &token in config.suppress_tokens.iter().chain(always.iter()).chain(special.no_speech.iter()) {
            if let Some(slot) = suppress.get_mut(token as usize) {
                *slot = true;
            }
        }

        let mut decoder = Self {
            model,
            tokenizer,
            config,
            special,
            suppress,
            language_token: None,
            task: options.task,
            temperature_fallback: options.temperature_fallback,
            rng: StdRng::seed_from_u64(seed),
        };

        if let Some(code) = &options.language {
            decoder.set_language(code);
        }

        Ok(decoder)
    }

    /// Prompt the decoder with a language. English-only checkpoints have no
    /// language tokens, in which case the prompt goes without one.
    pub fn set_language(&mut self, code: &str) {
        self.language_token = self.tokenizer.token_to_id(&language::token(code));
    }

    fn prompt(&self) -> Vec<u32> {
        let mut tokens = vec![self.special.sot];
        if let Some(language_token) = self.language_token {
            tokens.push(language_token);
        }
        tokens.push(match self.task {
            Task::Transcribe => self.special.transcribe,
            Task::Translate => self.special.translate,
        });
        tokens
    }

    /// Pick the most likely language from the first window of audio.
    pub fn detect_language(&mut self, mel: &Tensor) -> Result<&'static str> {
        let (_, _, frames) = mel.dims3()?;
        let mel = mel.narrow(2, 0, frames.min(m::N_FRAMES))?;
        let device = mel.device().clone();

        let candidates: Vec<(&'static str, u32)> = language::LANGUAGES
            .iter()
            .filter_map(|(code, _)| {
                self.tokenizer
                    .token_to_id(&language::token(code))
                    .map(|id| (*code, id))
            })
            .collect();

        if candidates.is_empty() {
            // English-only checkpoint
            return Ok("en");
        }

        let audio_features = self.model.encoder.forward(&mel, true)?;
        let tokens = Tensor::new(&[[self.special.sot]], &device)?;
        let ys = self.model.decoder.forward(&tokens, &audio_features, true)?;
        let logits: Vec<f32> = self
            .model
            .decoder
            .final_linear(&ys.i(..1)?)?
            .i(0)?
            .i(0)?
            .to_vec1()?;

        let (code, _) = candidates
            .iter()
            .filter_map(|(code, id)| logits.get(*id as usize).map(|l| (*code, *l)))
            .fold(("en", f32::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        tracing::debug!("Detected language: {}", code);
        Ok(code)
    }

    /// Decode every window of `mel` that holds real audio.
    ///
    /// `content_frames` excludes the silence candle pads onto the end of
    /// the spectrogram.
    pub fn run(&mut self, mel: &Tensor, content_frames: usize) -> Result<Vec<RawSegment>> {
        let (_, _, total_frames) = mel.dims3()?;
        let content_frames = content_frames.min(total_frames);
        let mut segments: Vec<RawSegment> = Vec::new();
        let mut seek = 0;

        while seek < content_frames {
            let time_offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let segment_size = (content_frames - seek).min(m::N_FRAMES);
            let window_duration = (segment_size * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            let mel_window = mel.narrow(2, seek, (total_frames - seek).min(m::N_FRAMES))?;
            seek += segment_size;

            let result = self.decode_with_fallback(&mel_window)?;
            if result.is_silence() {
                tracing::debug!(
                    "Skipping silent window at {:.1}s (no_speech={:.2}, avg_logprob={:.2})",
                    time_offset,
                    result.no_speech_prob,
                    result.avg_logprob
                );
                continue;
            }

            for span in timestamp_spans(&result.tokens, self.special.timestamp_begin(), self.special.eot) {
                let text = self
                    .tokenizer
                    .decode(&span.tokens, true)
                    .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                let last_end = segments.last().map(|s| s.end).unwrap_or(0.0);
                let (start, end) = place_span(&span, time_offset, window_duration, last_end);

                segments.push(RawSegment {
                    start,
                    end,
                    text: text.to_string(),
                });
            }
        }

        Ok(segments)
    }

    fn decode_with_fallback(&mut self, mel_window: &Tensor) -> Result<DecodingResult> {
        let audio_features = self.model.encoder.forward(mel_window, true)?;
        let temperatures: &[f64] = if self.temperature_fallback {
            &m::TEMPERATURES
        } else {
            &m::TEMPERATURES[..1]
        };

        let mut last = None;
        for &temperature in temperatures {
            let result = self.decode(&audio_features, temperature)?;
            if !result.needs_fallback() {
                return Ok(result);
            }
            tracing::debug!(
                "Decoding at t={} rejected (compression={:.2}, avg_logprob={:.2})",
                temperature,
                result.compression_ratio,
                result.avg_logprob
            );
            last = Some(result);
        }

        last.ok_or_else(|| anyhow!("No decoding temperatures configured"))
    }

    fn decode(&mut self, audio_features: &Tensor, temperature: f64) -> Result<DecodingResult> {
        let device = audio_features.device().clone();
        let sample_len = self.config.max_target_positions / 2;
        let mut tokens = self.prompt();
        let prompt_len = tokens.len();
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, audio_features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.special.no_speech {
                    let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    no_speech_prob = candle_nn::ops::softmax(&logits, 0)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let mut logits: Vec<f32> = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_vec1()?;

            self.filter_logits(&mut logits, &tokens[prompt_len..]);
            let (next, logprob) = self.select(&logits, temperature)?;
            sum_logprob += logprob;

            if next == self.special.eot {
                break;
            }
            tokens.push(next);
        }

        let generated = tokens[prompt_len..].to_vec();
        let avg_logprob = sum_logprob / generated.len().max(1) as f64;
        let compression_ratio = compression_ratio(&generated);

        Ok(DecodingResult {
            tokens: generated,
            avg_logprob,
            no_speech_prob,
            compression_ratio,
        })
    }

    fn filter_logits(&self, logits: &mut [f32], generated: &[u32]) {
        for (logit, &suppressed) in logits.iter_mut().zip(self.suppress.iter()) {
            if suppressed {
                *logit = f32::NEG_INFINITY;
            }
        }
        apply_timestamp_rules(logits, generated, self.special.eot, self.special.timestamp_begin());
    }

    /// Choose the next token, returning it with its log-probability.
    fn select(&mut self, logits: &[f32], temperature: f64) -> Result<(u32, f64)> {
        let logprobs = log_softmax(logits);
        if logprobs.iter().all(|l| !l.is_finite()) {
            return Ok((self.special.eot, 0.0));
        }

        let next = if temperature > 0.0 {
            let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let weights = logits
                .iter()
                .map(|l| (((l - max_logit) as f64) / temperature).exp());
            let distribution =
                WeightedIndex::new(weights).map_err(|e| anyhow!("Sampling failed: {}", e))?;
            distribution.sample(&mut self.rng) as u32
        } else {
            argmax(&logprobs)
        };

        Ok((next, logprobs[next as usize] as f64))
    }
}

/// Enforce Whisper's timestamp grammar on one step's logits.
///
/// - timestamps come in pairs: after a lone timestamp only another
///   timestamp or end-of-text may follow, after a pair text must follow
/// - timestamps never go backwards
/// - the first token is a timestamp no later than one second
/// - when timestamps are collectively more likely than any single text
///   token, a timestamp is forced
pub fn apply_timestamp_rules(logits: &mut [f32], generated: &[u32], eot: u32, timestamp_begin: u32) {
    let vocab = logits.len();
    let ts_begin = (timestamp_begin as usize).min(vocab);
    let eot = (eot as usize).min(vocab);

    let is_ts = |t: &u32| *t >= timestamp_begin;
    let last_was_ts = generated.last().map(is_ts).unwrap_or(false);
    let penultimate_was_ts = generated.len() < 2 || is_ts(&generated[generated.len() - 2]);

    if last_was_ts {
        if penultimate_was_ts {
            logits[ts_begin..].fill(f32::NEG_INFINITY);
        } else {
            logits[..eot].fill(f32::NEG_INFINITY);
        }
    }

    if let Some(&last_ts) = generated.iter().rev().find(|t| is_ts(t)) {
        let floor = if last_was_ts && !penultimate_was_ts {
            last_ts
        } else {
            last_ts + 1
        };
        logits[ts_begin..(floor as usize).min(vocab)].fill(f32::NEG_INFINITY);
    }

    if generated.is_empty() {
        logits[..ts_begin].fill(f32::NEG_INFINITY);
        let last_allowed = ts_begin + MAX_INITIAL_TIMESTAMP_STEPS as usize + 1;
        if last_allowed < vocab {
            logits[last_allowed..].fill(f32::NEG_INFINITY);
        }
    }

    let logprobs = log_softmax(logits);
    let ts_logprob = log_sum_exp(&logprobs[ts_begin..]);
    let max_text_logprob = logprobs[..ts_begin]
        .iter()
        .cloned()
        .fold(f32::NEG_INFINITY, f32::max);
    if ts_logprob > max_text_logprob {
        logits[..ts_begin].fill(f32::NEG_INFINITY);
    }
}

/// Split generated tokens into text spans delimited by timestamp tokens.
pub fn timestamp_spans(tokens: &[u32], timestamp_begin: u32, eot: u32) -> Vec<TokenSpan> {
    let mut spans = Vec::new();
    let mut start = 0.0;
    let mut text = Vec::new();

    for &token in tokens {
        if token >= timestamp_begin {
            let time = (token - timestamp_begin) as f64 / TIMESTAMPS_PER_SECOND;
            if !text.is_empty() {
                spans.push(TokenSpan {
                    start,
                    end: Some(time),
                    tokens: std::mem::take(&mut text),
                });
            }
            start = time;
        } else if token < eot {
            text.push(token);
        }
    }

    if !text.is_empty() {
        spans.push(TokenSpan {
            start,
            end: None,
            tokens: text,
        });
    }

    spans
}

/// Absolute `(start, end)` of a span decoded from the window at `time_offset`.
///
/// Times are clipped to the window, an unclosed span runs to the window end,
/// and a span never starts before `last_end` or ends before it starts.
pub fn place_span(span: &TokenSpan, time_offset: f64, window_duration: f64, last_end: f64) -> (f64, f64) {
    let start = (time_offset + span.start.min(window_duration)).max(last_end).max(0.0);
    let end = (time_offset + span.end.unwrap_or(window_duration).min(window_duration)).max(start);
    (start, end)
}

/// Repetition score of a token sequence: the inverse share of distinct
/// bigrams. A looping decoder produces few distinct bigrams.
pub fn compression_ratio(tokens: &[u32]) -> f64 {
    if tokens.len() < 2 {
        return 1.0;
    }

    let unique: std::collections::HashSet<(u32, u32)> =
        tokens.windows(2).map(|w| (w[0], w[1])).collect();
    let unique_ratio = unique.len() as f64 / (tokens.len() - 1) as f64;
    1.0 / unique_ratio.max(0.01)
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let lse = log_sum_exp(logits);
    logits.iter().map(|l| l - lse).collect()
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    // Miniature vocabulary: 0..10 text, 10 = eot, 11 = no_timestamps, 12.. timestamps
    const EOT: u32 = 10;
    const TS: u32 = 12;
    const VOCAB: usize = 80;

    fn flat() -> Vec<f32> {
        vec![0.0; VOCAB]
    }

    #[test]
    fn test_first_token_must_be_early_timestamp() {
        let mut logits = flat();
        apply_timestamp_rules(&mut logits, &[], EOT, TS);
        assert!(logits[..TS as usize].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[TS as usize].is_finite());
        assert!(logits[TS as usize + 50].is_finite());
        assert!(logits[TS as usize + 51..].iter().all(|l| *l == f32::NEG_INFINITY));
    }

    #[test]
    fn test_lone_timestamp_requires_closing_timestamp() {
        let mut logits = flat();
        // text, then an opening timestamp
        apply_timestamp_rules(&mut logits, &[TS, 3, 4, TS + 20], EOT, TS);
        assert!(logits[..EOT as usize].iter().all(|l| *l == f32::NEG_INFINITY));
        // can close at the same time or later, never earlier
        assert!(logits[TS as usize + 19] == f32::NEG_INFINITY);
        assert!(logits[TS as usize + 20].is_finite());
    }

    #[test]
    fn test_timestamp_pair_requires_text() {
        let mut logits = flat();
        apply_timestamp_rules(&mut logits, &[TS, 3, TS + 10, TS + 10], EOT, TS);
        assert!(logits[TS as usize..].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[3].is_finite());
    }

    #[test]
    fn test_timestamp_forced_when_collectively_likely() {
        let mut logits = flat();
        // Text after an open pair: timestamps are many, text is few
        apply_timestamp_rules(&mut logits, &[TS, 3], EOT, TS);
        assert!(logits[..TS as usize].iter().all(|l| *l == f32::NEG_INFINITY));

        let mut logits = flat();
        logits[5] = 20.0;
        apply_timestamp_rules(&mut logits, &[TS, 3], EOT, TS);
        assert_eq!(logits[5], 20.0);
    }

    #[test]
    fn test_timestamp_spans() {
        // <|0.00|> a b <|1.00|><|1.00|> c <|2.50|> d
        let tokens = [TS, 1, 2, TS + 50, TS + 50, 3, TS + 125, 4];
        let spans = timestamp_spans(&tokens, TS, EOT);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0], TokenSpan { start: 0.0, end: Some(1.0), tokens: vec![1, 2] });
        assert_eq!(spans[1], TokenSpan { start: 1.0, end: Some(2.5), tokens: vec![3] });
        assert_eq!(spans[2], TokenSpan { start: 2.5, end: None, tokens: vec![4] });
    }

    #[test]
    fn test_spans_skip_special_tokens() {
        let spans = timestamp_spans(&[1, EOT, 11, 2], TS, EOT);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].tokens, vec![1, 2]);
        assert_eq!(spans[0].end, None);
    }

    fn span(start: f64, end: Option<f64>) -> TokenSpan {
        TokenSpan { start, end, tokens: vec![1] }
    }

    #[test]
    fn test_place_span() {
        // Second window starts at 30s and holds 12s of audio
        assert_eq!(place_span(&span(1.0, Some(2.5)), 30.0, 12.0, 29.0), (31.0, 32.5));
        // Unclosed span runs to the end of the audio in the window
        assert_eq!(place_span(&span(4.0, None), 30.0, 12.0, 29.0), (34.0, 42.0));
        // Timestamps past the real audio are clipped
        assert_eq!(place_span(&span(13.0, Some(20.0)), 30.0, 12.0, 29.0), (42.0, 42.0));
        // Never overlaps the previous segment
        assert_eq!(place_span(&span(0.0, Some(0.5)), 30.0, 12.0, 30.8), (30.8, 30.8));
    }

    #[test]
    fn test_placed_spans_are_ordered() {
        let spans = [span(0.0, Some(3.0)), span(2.0, Some(1.0)), span(5.0, None), span(0.5, Some(0.7))];
        let mut last_end = 0.0;
        for s in &spans {
            let (start, end) = place_span(s, 0.0, 8.0, last_end);
            assert!(start >= 0.0);
            assert!(start >= last_end, "{} < {}", start, last_end);
            assert!(end >= start);
            last_end = end;
        }
    }

    #[test]
    fn test_compression_ratio() {
        let varied: Vec<u32> = (0..40).collect();
        assert!(compression_ratio(&varied) < 1.01);

        let looping: Vec<u32> = std::iter::repeat([7, 8]).take(20).flatten().collect();
        assert!(compression_ratio(&looping) > m::COMPRESSION_RATIO_THRESHOLD);
        assert_eq!(compression_ratio(&[]), 1.0);
    }

    #[test]
    fn test_log_softmax_and_argmax() {
        let logits = [1.0f32, 3.0, 2.0, f32::NEG_INFINITY];
        let lp = log_softmax(&logits);
        let total: f32 = lp.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(argmax(&lp), 1);
    }
}
