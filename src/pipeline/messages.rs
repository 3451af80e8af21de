//! Message types passed between pipeline stages.

use std::path::PathBuf;

/// A fixed-size block of mono audio samples from the microphone.
///
/// Immutable once read; samples are f32 in [-1, 1] at the capture rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// One contiguous stretch of user speech, lead buffer included, ready
/// for recognition.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Utterance {
    /// Duration of the utterance in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A chunk emitted by the streaming chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// Reasoning text from models that expose it; printed, never spoken.
    Thinking(String),
    /// A fragment of the spoken reply, possibly containing speaker markers.
    Response(String),
    /// Backend failure surfaced to the user.
    Error(String),
}

/// Kind of a segmenter output event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Untagged text outside any speaker structure. Never synthesized.
    Text,
    /// A speakable unit attributed to a speaker.
    Speech,
}

/// A segment produced by the incremental segmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    pub kind: SegmentKind,
    /// Always present for `Speech`, always absent for `Text`.
    pub speaker: Option<String>,
    pub content: String,
}

impl SegmentEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Text,
            speaker: None,
            content: content.into(),
        }
    }

    pub fn speech(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Speech,
            speaker: Some(speaker.into()),
            content: content.into(),
        }
    }
}

/// Control events flowing from the capture side to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Confirmed user speech onset; the barge-in flag has been raised.
    UserSpeechStart,
}

/// A synthesis job queued for the TTS worker.
#[derive(Debug, Clone)]
pub struct TtsJob {
    pub text: String,
    pub speaker: String,
}

/// A synthesized WAV ready for playback, ordered by `sequence_no`.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub sequence_no: u64,
    pub speaker: String,
}
