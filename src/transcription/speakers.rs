//! Pause-based speaker labels.
//!
//! No diarization model is involved: a silence longer than the configured gap
//! is taken as a change of speaker, alternating between "Speaker 1" and
//! "Speaker 2" by segment index.

use crate::protocol::{round2, Segment};
use crate::transcription::decoder::RawSegment;
use std::collections::HashSet;

pub const DEFAULT_SPEAKER: &str = "Speaker 1";

/// Label `segments` and count distinct speakers.
///
/// With detection off every segment is "Speaker 1" and the count is 1.
/// Times in the result are rounded to two decimals; the gap test uses the
/// unrounded times.
pub fn assign_speakers(segments: &[RawSegment], detection: bool, gap_seconds: f64) -> (Vec<Segment>, usize) {
    let mut current = DEFAULT_SPEAKER.to_string();
    let mut last_end = 0.0;
    let mut labelled = Vec::with_capacity(segments.len());

    for (i, segment) in segments.iter().enumerate() {
        if detection && segment.start - last_end > gap_seconds {
            current = format!("Speaker {}", (i % 2) + 1);
        }
        labelled.push(Segment {
            speaker: current.clone(),
            text: segment.text.trim().to_string(),
            start: round2(segment.start),
            end: round2(segment.end),
        });
        last_end = segment.end;
    }

    let speakers = if detection {
        labelled
            .iter()
            .map(|s| s.speaker.as_str())
            .collect::<HashSet<_>>()
            .len()
    } else {
        1
    };

    (labelled, speakers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> RawSegment {
        RawSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    fn speakers_of(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.speaker.as_str()).collect()
    }

    #[test]
    fn test_long_pause_switches_speaker() {
        let raw = vec![
            seg(0.0, 2.0, " Hello there."),
            seg(5.0, 7.0, " Hi!"),
            seg(7.5, 9.0, " How are you?"),
            seg(12.0, 13.0, " Fine."),
        ];
        let (segments, count) = assign_speakers(&raw, true, 2.0);
        assert_eq!(speakers_of(&segments), vec!["Speaker 1", "Speaker 2", "Speaker 2", "Speaker 2"]);
        // index 3 is odd: (3 % 2) + 1 == 2, so the pause keeps Speaker 2
        assert_eq!(count, 2);
        assert_eq!(segments[0].text, "Hello there.");
    }

    #[test]
    fn test_pause_at_even_index_returns_to_speaker_one() {
        let raw = vec![seg(0.0, 1.0, "a"), seg(4.0, 5.0, "b"), seg(8.0, 9.0, "c")];
        let (segments, count) = assign_speakers(&raw, true, 2.0);
        assert_eq!(speakers_of(&segments), vec!["Speaker 1", "Speaker 2", "Speaker 1"]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_leading_silence_counts_from_zero() {
        // First segment starts after a 3s pause: index 0 maps to Speaker 1
        let raw = vec![seg(3.0, 4.0, "late start")];
        let (segments, count) = assign_speakers(&raw, true, 2.0);
        assert_eq!(speakers_of(&segments), vec!["Speaker 1"]);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_gap_must_exceed_threshold() {
        let raw = vec![seg(0.0, 1.0, "a"), seg(3.0, 4.0, "b")];
        let (segments, _) = assign_speakers(&raw, true, 2.0);
        assert_eq!(speakers_of(&segments), vec!["Speaker 1", "Speaker 1"]);
    }

    #[test]
    fn test_detection_off() {
        let raw = vec![seg(0.0, 1.0, "a"), seg(10.0, 11.0, "b")];
        let (segments, count) = assign_speakers(&raw, false, 2.0);
        assert_eq!(speakers_of(&segments), vec!["Speaker 1", "Speaker 1"]);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_times_are_rounded() {
        let raw = vec![seg(0.123, 1.987, "a")];
        let (segments, _) = assign_speakers(&raw, true, 2.0);
        assert_eq!(segments[0].start, 0.12);
        assert_eq!(segments[0].end, 1.99);
    }

    #[test]
    fn test_no_segments() {
        let (segments, count) = assign_speakers(&[], true, 2.0);
        assert!(segments.is_empty());
        assert_eq!(count, 0);
    }
}
