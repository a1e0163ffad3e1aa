//! Transcript and chunk records shared across pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunker::TranscriptChunk;

/// One speaker utterance from a synced call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Recording the utterance belongs to.
    pub recording_id: i64,
    /// Display name of the speaker, when the transcript provider knows it.
    pub speaker_name: Option<String>,
    /// Speaker email, when known.
    pub speaker_email: Option<String>,
    /// Spoken text.
    pub text: String,
    /// Offset within the call (e.g. `00:12:31`).
    pub timestamp: Option<String>,
}

impl TranscriptSegment {
    /// Builds a segment with an optional speaker and no timestamp.
    pub fn new(recording_id: i64, speaker_name: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            recording_id,
            speaker_name: speaker_name.map(str::to_string),
            speaker_email: None,
            text: text.into(),
            timestamp: None,
        }
    }

    /// Attaches a timestamp.
    pub fn at(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Attaches a speaker email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.speaker_email = Some(email.into());
        self
    }
}

/// Call-level metadata copied onto every chunk row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Recording identifier.
    pub recording_id: i64,
    /// Call title.
    pub title: String,
    /// When the call was recorded.
    pub created_at: DateTime<Utc>,
    /// Tag/category assigned to the call, if any.
    pub category: Option<String>,
}

/// Row persisted into `transcript_chunks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRow {
    /// Owning user.
    pub user_id: Uuid,
    /// Source recording.
    pub recording_id: i64,
    /// Chunk body submitted to the embedding model.
    pub chunk_text: String,
    /// Dense 0-based position within the recording.
    pub chunk_index: i32,
    /// First speaker heard in the chunk.
    pub speaker_name: Option<String>,
    /// Email of the first speaker, taken from the first segment they spoke.
    pub speaker_email: Option<String>,
    /// Timestamp of the first timed segment.
    pub timestamp_start: Option<String>,
    /// Timestamp of the last timed segment.
    pub timestamp_end: Option<String>,
    /// Call date copied from the call record.
    pub call_date: DateTime<Utc>,
    /// Call title copied from the call record.
    pub call_title: String,
    /// Call category copied from the call record.
    pub call_category: Option<String>,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
    /// When the embedding was generated.
    pub embedded_at: DateTime<Utc>,
}

impl ChunkRow {
    /// Assembles a storable row from a chunk, its call, and its embedding.
    pub fn assemble(
        user_id: Uuid,
        call: &CallMetadata,
        chunk: &TranscriptChunk,
        segments: &[TranscriptSegment],
        embedding: Vec<f32>,
        embedded_at: DateTime<Utc>,
    ) -> Self {
        let speaker_name = chunk.primary_speaker().map(str::to_string);
        let speaker_email = speaker_name.as_deref().map(str::trim).and_then(|name| {
            segments
                .iter()
                .find(|segment| segment.speaker_name.as_deref().map(str::trim) == Some(name))
                .and_then(|segment| segment.speaker_email.clone())
        });
        Self {
            user_id,
            recording_id: call.recording_id,
            chunk_text: chunk.text.clone(),
            chunk_index: i32::try_from(chunk.chunk_index).unwrap_or(i32::MAX),
            speaker_name,
            speaker_email,
            timestamp_start: chunk.start_timestamp.clone(),
            timestamp_end: chunk.end_timestamp.clone(),
            call_date: call.created_at,
            call_title: call.title.clone(),
            call_category: call.category.clone(),
            embedding,
            embedded_at,
        }
    }
}
