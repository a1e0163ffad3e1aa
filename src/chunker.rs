//! Token-budgeted transcript chunking with sliding overlap.
//!
//! Segments are rendered as `"{speaker}: {text}"` lines and packed into chunks
//! whose estimated token count stays within `max_tokens`. When a chunk closes,
//! its trailing lines are carried into the next chunk as overlap, bounded by
//! `overlap_tokens`. A segment whose own estimate exceeds the overlap budget is
//! never carried forward, so partial segments never appear.

use serde::{Deserialize, Serialize};

use crate::transcript::TranscriptSegment;

/// Default chunk ceiling in estimated tokens.
pub const DEFAULT_MAX_TOKENS: usize = 400;
/// Default overlap budget in estimated tokens.
pub const DEFAULT_OVERLAP_TOKENS: usize = 100;

/// Chunk sizing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Upper bound on a chunk's estimated token count.
    pub max_tokens: usize,
    /// Upper bound on the tokens carried from one chunk into the next.
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkingConfig {
    fn normalized(&self) -> (usize, usize) {
        let max = self.max_tokens.max(1);
        let overlap = self.overlap_tokens.min(max.saturating_sub(1));
        (max, overlap)
    }
}

/// A bounded slice of a transcript, ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    /// Dense 0-based position in emission order.
    pub chunk_index: usize,
    /// Rendered lines joined with `\n`.
    pub text: String,
    /// Speakers in first-appearance order, without duplicates.
    pub speakers: Vec<String>,
    /// Timestamp of the first timed segment in the chunk.
    pub start_timestamp: Option<String>,
    /// Timestamp of the last timed segment in the chunk.
    pub end_timestamp: Option<String>,
    /// Sum of the estimates of every line in the chunk.
    pub token_estimate: usize,
    /// Indices into the input slice, in order.
    pub segments: Vec<usize>,
    /// How many leading entries of `segments` were carried from the previous chunk.
    pub overlap_segments: usize,
}

impl TranscriptChunk {
    /// First speaker heard in the chunk.
    pub fn primary_speaker(&self) -> Option<&str> {
        self.speakers.first().map(String::as_str)
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

struct Line<'a> {
    index: usize,
    rendered: String,
    tokens: usize,
    speaker: Option<&'a str>,
    timestamp: Option<&'a str>,
}

fn render(index: usize, segment: &TranscriptSegment) -> Option<Line<'_>> {
    let text = segment.text.trim();
    if text.is_empty() {
        return None;
    }
    let speaker = segment
        .speaker_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let rendered = match speaker {
        Some(name) => format!("{name}: {text}"),
        None => text.to_string(),
    };
    let tokens = estimate_tokens(&rendered);
    Some(Line {
        index,
        rendered,
        tokens,
        speaker,
        timestamp: segment.timestamp.as_deref(),
    })
}

/// Splits ordered segments into chunks. Pure and deterministic.
pub fn chunk_transcript(
    segments: &[TranscriptSegment],
    config: &ChunkingConfig,
) -> Vec<TranscriptChunk> {
    let (max_tokens, overlap_tokens) = config.normalized();
    let lines: Vec<Line<'_>> = segments
        .iter()
        .enumerate()
        .filter_map(|(idx, segment)| render(idx, segment))
        .collect();

    let mut chunks = Vec::new();
    let mut buffer: Vec<usize> = Vec::new();
    let mut carried = 0usize;
    let mut token_total = 0usize;

    for (pos, line) in lines.iter().enumerate() {
        if !buffer.is_empty() && token_total + line.tokens > max_tokens {
            flush_chunk(&mut chunks, &buffer, carried, &lines);
            let budget = overlap_tokens.min(max_tokens.saturating_sub(line.tokens));
            buffer = retain_overlap(&buffer, &lines, budget);
            carried = buffer.len();
            token_total = buffer.iter().map(|&p| lines[p].tokens).sum();
        }
        buffer.push(pos);
        token_total += line.tokens;
    }

    if !buffer.is_empty() {
        flush_chunk(&mut chunks, &buffer, carried, &lines);
    }

    chunks
}

fn flush_chunk(
    chunks: &mut Vec<TranscriptChunk>,
    buffer: &[usize],
    carried: usize,
    lines: &[Line<'_>],
) {
    let mut speakers: Vec<String> = Vec::new();
    let mut start_timestamp = None;
    let mut end_timestamp = None;
    let mut token_estimate = 0usize;
    let mut text = String::new();

    for &pos in buffer {
        let line = &lines[pos];
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&line.rendered);
        token_estimate += line.tokens;
        if let Some(name) = line.speaker {
            if !speakers.iter().any(|known| known == name) {
                speakers.push(name.to_string());
            }
        }
        if let Some(ts) = line.timestamp {
            if start_timestamp.is_none() {
                start_timestamp = Some(ts.to_string());
            }
            end_timestamp = Some(ts.to_string());
        }
    }

    chunks.push(TranscriptChunk {
        chunk_index: chunks.len(),
        text,
        speakers,
        start_timestamp,
        end_timestamp,
        token_estimate,
        segments: buffer.iter().map(|&pos| lines[pos].index).collect(),
        overlap_segments: carried,
    });
}

/// Keeps the longest trailing run whose cumulative tokens fit in `budget`.
fn retain_overlap(buffer: &[usize], lines: &[Line<'_>], budget: usize) -> Vec<usize> {
    if budget == 0 {
        return Vec::new();
    }
    let mut retained = Vec::new();
    let mut tokens = 0usize;
    for &pos in buffer.iter().rev() {
        let next = tokens + lines[pos].tokens;
        if next > budget {
            break;
        }
        retained.push(pos);
        tokens = next;
    }
    retained.reverse();
    retained
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unspoken(text: String) -> TranscriptSegment {
        TranscriptSegment::new(1, None, text)
    }

    /// Segment whose rendered form is exactly `tokens` estimated tokens.
    fn sized(tokens: usize) -> TranscriptSegment {
        unspoken("w".repeat(tokens * 4))
    }

    fn config(max_tokens: usize, overlap_tokens: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_tokens,
            overlap_tokens,
        }
    }

    #[test]
    fn estimates_tokens_by_quarter_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn segment_larger_than_overlap_is_not_carried() {
        let segments = vec![sized(150), sized(150), sized(150)];
        let chunks = chunk_transcript(&segments, &config(300, 100));

        let layout: Vec<Vec<usize>> = chunks.iter().map(|c| c.segments.clone()).collect();
        assert_eq!(layout, vec![vec![0, 1], vec![2]]);
        assert_eq!(chunks[0].token_estimate, 300);
        assert_eq!(chunks[1].overlap_segments, 0);
    }

    #[test]
    fn segment_within_overlap_is_carried() {
        let segments = vec![sized(150), sized(150), sized(150)];
        let chunks = chunk_transcript(&segments, &config(300, 150));

        let layout: Vec<Vec<usize>> = chunks.iter().map(|c| c.segments.clone()).collect();
        assert_eq!(layout, vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(chunks[1].overlap_segments, 1);
        assert_eq!(chunks[1].token_estimate, 300);
    }

    #[test]
    fn overlap_shrinks_to_fit_incoming_segment() {
        // 40 + 40 fits the overlap budget, but the incoming 250 only leaves room for one.
        let segments = vec![sized(100), sized(40), sized(40), sized(250)];
        let chunks = chunk_transcript(&segments, &config(300, 100));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].segments, vec![2, 3]);
        assert!(chunks.iter().all(|c| c.token_estimate <= 300));
    }

    #[test]
    fn oversized_segment_stands_alone() {
        let segments = vec![sized(50), sized(900), sized(50)];
        let chunks = chunk_transcript(&segments, &config(400, 100));

        let layout: Vec<Vec<usize>> = chunks.iter().map(|c| c.segments.clone()).collect();
        assert_eq!(layout, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(chunks[1].token_estimate, 900);
    }

    #[test]
    fn blank_segments_are_skipped() {
        let segments = vec![
            unspoken("   ".into()),
            TranscriptSegment::new(1, Some("Ada"), "hello"),
            unspoken(String::new()),
        ];
        let chunks = chunk_transcript(&segments, &ChunkingConfig::default());

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Ada: hello");
        assert_eq!(chunks[0].segments, vec![1]);

        assert!(chunk_transcript(&[unspoken(" \n".into())], &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn renders_speakers_and_timestamps() {
        let segments = vec![
            TranscriptSegment::new(1, Some("Ada"), "Morning").at("00:00:01"),
            TranscriptSegment::new(1, None, "(crosstalk)"),
            TranscriptSegment::new(1, Some("Grace"), "Hi Ada").at("00:00:05"),
            TranscriptSegment::new(1, Some("Ada"), "Shall we start?").at("00:00:09"),
        ];
        let chunks = chunk_transcript(&segments, &ChunkingConfig::default());

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].text,
            "Ada: Morning\n(crosstalk)\nGrace: Hi Ada\nAda: Shall we start?"
        );
        assert_eq!(chunks[0].speakers, vec!["Ada".to_string(), "Grace".to_string()]);
        assert_eq!(chunks[0].primary_speaker(), Some("Ada"));
        assert_eq!(chunks[0].start_timestamp.as_deref(), Some("00:00:01"));
        assert_eq!(chunks[0].end_timestamp.as_deref(), Some("00:00:09"));
    }

    #[test]
    fn long_transcript_respects_bounds_and_covers_every_segment() {
        let segments: Vec<TranscriptSegment> = (0..120)
            .map(|i| {
                let speaker = if i % 3 == 0 { "Ada" } else { "Grace" };
                TranscriptSegment::new(1, Some(speaker), "x".repeat(20 + (i * 37) % 300))
            })
            .collect();
        let cfg = config(400, 100);
        let chunks = chunk_transcript(&segments, &cfg);

        let mut seen = vec![false; segments.len()];
        for (idx, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, idx);
            assert!(chunk.token_estimate <= cfg.max_tokens || chunk.segments.len() == 1);
            for &segment in &chunk.segments {
                seen[segment] = true;
            }
            let carried: usize = chunk.segments[..chunk.overlap_segments]
                .iter()
                .map(|&s| {
                    let speaker = segments[s].speaker_name.as_deref().unwrap_or_default();
                    estimate_tokens(&format!("{speaker}: {}", segments[s].text))
                })
                .sum();
            assert!(carried <= cfg.overlap_tokens);
        }
        assert!(seen.into_iter().all(|s| s));

        // Same input, same output.
        assert_eq!(chunks, chunk_transcript(&segments, &cfg));
    }

    #[test]
    fn zero_overlap_never_repeats_segments() {
        let segments: Vec<TranscriptSegment> = (0..10).map(|_| sized(90)).collect();
        let chunks = chunk_transcript(&segments, &config(200, 0));

        let flattened: Vec<usize> = chunks.iter().flat_map(|c| c.segments.clone()).collect();
        assert_eq!(flattened, (0..10).collect::<Vec<_>>());
    }
}
