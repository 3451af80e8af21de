//! Error types for the voxloop pipeline.

/// Top-level error type for the speech-to-speech pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech recognition backend error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model backend error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Conversation history error.
    #[error("history error: {0}")]
    History(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
