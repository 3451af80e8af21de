//! voxloop: real-time speech-to-speech conversation pipeline.
//!
//! A continuous microphone stream is carved into utterances by a
//! VAD-gated capture stage, recognized, answered by a streaming LLM
//! backend, incrementally segmented into speaker-tagged speakable units,
//! synthesized, and played back — while the user can barge in and silence
//! the system mid-reply.
//!
//! # Architecture
//!
//! Independent stages connected by channels:
//! - **Capture**: microphone frames via `cpal`
//! - **VAD gate**: speech boundaries + dynamic echo-guard threshold
//! - **ASR**: utterance WAV → transcript (local inference server)
//! - **LLM**: streaming chat with bounded, summarized history
//! - **Segmenter**: speaker-tagged token stream → speakable segments
//! - **TTS**: segment → cache WAV, silent-output guard
//! - **Playback**: sequential, interruptible output via `cpal`

pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod segmenter;
pub mod tts;
pub mod vad;

pub use config::PipelineConfig;
pub use error::{Result, SpeechError};
pub use pipeline::coordinator::PipelineCoordinator;
