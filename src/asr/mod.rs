//! Speech recognition adapter.
//!
//! The pipeline treats recognition as a synchronous, non-streaming call
//! against a local inference server; the capture stage guarantees at most
//! one invocation in flight.

use crate::config::AsrConfig;
use crate::error::{Result, SpeechError};
use std::path::Path;
use tracing::info;

/// Turns one utterance WAV into a transcript.
pub trait AsrAdapter {
    /// Transcribe the WAV at `wav_path`. An empty string is a valid result.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails.
    fn transcribe(&self, wav_path: &Path, language: &str, prompt: &str) -> Result<String>;
}

/// HTTP adapter for a local ASR inference server.
///
/// Sends the raw WAV as the request body with `language` and `prompt`
/// query parameters and expects `{"text": "..."}` back.
pub struct HttpAsr {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpAsr {
    pub fn new(config: &AsrConfig) -> Self {
        info!("ASR adapter configured: {}", config.endpoint);
        Self {
            endpoint: config.endpoint.clone(),
            agent: ureq::agent(),
        }
    }
}

impl AsrAdapter for HttpAsr {
    fn transcribe(&self, wav_path: &Path, language: &str, prompt: &str) -> Result<String> {
        let wav_bytes = std::fs::read(wav_path)?;

        let response = self
            .agent
            .post(&self.endpoint)
            .query("language", language)
            .query("prompt", prompt)
            .set("Content-Type", "audio/wav")
            .send_bytes(&wav_bytes)
            .map_err(|e| SpeechError::Asr(format!("inference request failed: {e}")))?;

        let raw = response
            .into_string()
            .map_err(|e| SpeechError::Asr(format!("cannot read inference response: {e}")))?;
        let body: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| SpeechError::Asr(format!("malformed inference response: {e}")))?;

        let text = body["text"].as_str().unwrap_or_default().trim().to_owned();
        Ok(text)
    }
}
