//! Configuration types for the voxloop pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Audio capture sizing.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech recognition backend settings.
    pub asr: AsrConfig,
    /// Context prompt handed to the ASR backend alongside each utterance.
    pub asr_prompt: String,
    /// Streaming chat backend + history bounds.
    pub ollama: OllamaConfig,
    /// Speech synthesis backend settings.
    pub tts: TtsConfig,
    /// Speaker name → reference voice sample. Must contain an `unknown` entry
    /// used as the fallback for unmapped speakers.
    pub speaker_voices: HashMap<String, PathBuf>,
    /// Silent-output guard for synthesized audio.
    pub silence_detection: SilenceDetectionConfig,
    /// First value of the synthesized-artifact sequence counter.
    pub worker_counter_start: u64,
    /// Logging level and optional log file.
    pub logging: LoggingConfig,
    /// System prompt templates for the chat backend.
    pub ai_prompts: PromptsConfig,
    /// Display name attached to keyboard and voice inputs as the speaker id.
    pub user_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut speaker_voices = HashMap::new();
        speaker_voices.insert(
            "unknown".to_owned(),
            PathBuf::from("resources/voice/default.wav"),
        );
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            asr: AsrConfig::default(),
            asr_prompt: "这是一场关于人工智能的技术讨论，其中包括 whisper 和 LLM 模型的内容。输出需要带标点符号。".to_owned(),
            ollama: OllamaConfig::default(),
            tts: TtsConfig::default(),
            speaker_voices,
            silence_detection: SilenceDetectionConfig::default(),
            worker_counter_start: 1,
            logging: LoggingConfig::default(),
            ai_prompts: PromptsConfig::default(),
            user_name: "unknown".to_owned(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SpeechError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file, falling back to built-in
    /// defaults (with a warning) when the file is missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("cannot load config from {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Resolve the reference voice sample for a speaker, falling back to the
    /// `unknown` entry when the speaker has no mapping.
    pub fn voice_for_speaker(&self, speaker: &str) -> Option<&PathBuf> {
        self.speaker_voices
            .get(speaker)
            .or_else(|| self.speaker_voices.get("unknown"))
    }
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Number of input channels (1 = mono).
    pub channels: u16,
    /// Capture sample rate in Hz.
    pub rate: u32,
    /// Frame size in samples.
    pub chunk: u32,
    /// Consecutive non-speech frames that end an utterance.
    pub silence_frame_threshold: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl AudioConfig {
    /// Ring capacity for the pre-speech lead buffer: ~2 seconds of frames.
    pub fn lead_ring_frames(&self) -> usize {
        (self.rate / self.chunk.max(1)) as usize * 2
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            rate: 16_000,
            chunk: 512,
            silence_frame_threshold: 20,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Base speech-probability threshold in [0, 1].
    pub sensitivity: f32,
    /// Added to the base threshold while playback is active, so the mic does
    /// not trigger on the system's own voice. The raised threshold is clamped
    /// to 0.95.
    pub play_sensitivity_factor: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.6,
            play_sensitivity_factor: 0.2,
        }
    }
}

/// Speech recognition backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Inference endpoint of the local ASR server.
    pub endpoint: String,
    /// Model path hint forwarded to the backend (informational for HTTP
    /// servers that load their model at startup).
    pub model_path: String,
    /// Device hint ("cuda", "cpu"); None lets the backend choose.
    pub device: Option<String>,
    /// Transcription language code.
    pub language: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/inference".to_owned(),
            model_path: String::new(),
            device: None,
            language: "zh".to_owned(),
        }
    }
}

/// Streaming chat backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Model name requested from the chat server.
    pub model: String,
    /// Base URL of the Ollama-compatible server.
    pub endpoint: String,
    /// Total turn count at which history compression becomes eligible.
    pub max_history: u64,
    /// Compress every N turns once eligible; also the number of most-recent
    /// messages preserved verbatim by a compression pass.
    pub compress_interval: u64,
    /// Path of the persisted history JSON.
    pub history_path: PathBuf,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            model: "gemma3:27b".to_owned(),
            endpoint: "http://127.0.0.1:11434".to_owned(),
            max_history: 30,
            compress_interval: 20,
            history_path: PathBuf::from("history.json"),
        }
    }
}

/// Speech synthesis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint of the local TTS server.
    pub endpoint: String,
    /// Model directory hint forwarded to the backend.
    pub model_dir: String,
    /// Model config path hint forwarded to the backend.
    pub cfg_path: String,
    /// Directory for synthesized WAV artifacts and the capture scratch file.
    pub cache_dir: PathBuf,
    /// Extra generation parameters passed through to the backend verbatim.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9880/synthesize".to_owned(),
            model_dir: "resources/checkpoints".to_owned(),
            cfg_path: "resources/checkpoints/config.yaml".to_owned(),
            cache_dir: PathBuf::from("./cache"),
            kwargs: serde_json::Map::new(),
        }
    }
}

/// Silent-output guard configuration for synthesized audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceDetectionConfig {
    /// Level in dBFS below which audio counts as silent.
    pub silence_threshold: f32,
    /// Minimum length in ms for a quiet stretch to count as a silence run.
    pub min_silence_len: u32,
}

impl Default for SilenceDetectionConfig {
    fn default() -> Self {
        Self {
            silence_threshold: -50.0,
            min_silence_len: 1000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter ("trace" … "error").
    pub level: String,
    /// Log file path; None logs to stderr only.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: Some(PathBuf::from("./logs/system.log")),
        }
    }
}

/// System prompt templates. `{speaker_id}` and `{current_time}` are
/// interpolated at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_role: String,
    pub speaking_format: String,
    pub speaker_format: String,
    pub example: String,
    pub natural_response: String,
    pub silence_if_irrelevant: String,
    pub silence_if_not_spoken_to: String,
    pub time_context: String,
    /// Prompt prefix for history summarization.
    pub summarize: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_role: "你是超强的人工智能助手，你会灵活的切换钟离、温迪、胡桃、或者可莉的角色，你正在和 {speaker_id} 对话。默认助手角色是钟离。".to_owned(),
            speaking_format: "使用自然对话的说话方式，只输出中文文字和标点，不输出阿拉伯数字和特殊符号。".to_owned(),
            speaker_format: "请标注说话人的身份，说话格式是'[[/speaker_start]说话人[/speaker_end]]说话内容\n[/say_end]'，注意一定要添加句子结尾标识符。".to_owned(),
            example: "示例'[[/speaker_start]钟离[/speaker_end]]你好， {speaker_id} 。\n[/say_end]'".to_owned(),
            natural_response: "注意说话要自然，符合说话的习惯，简短回复，不要过分重复。注意用户语音输入可能有文字识别错误，尽量理解真实含义。".to_owned(),
            silence_if_irrelevant: "如果用户输入无意义的内容，你应该保持语音沉默。只回复 None。".to_owned(),
            silence_if_not_spoken_to: "识别到用户输入内容不是在和你说话，与你无关时，你应该保持语音沉默。比如没有喊你的名字时只回复 None。".to_owned(),
            time_context: "当前时间是 {current_time}，请根据时间进行适当的回应。".to_owned(),
            summarize: "请对以下对话历史进行简洁的总结，保留关键信息和上下文关系。".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.audio.rate, 16_000);
        assert_eq!(config.audio.chunk, 512);
        assert_eq!(config.audio.silence_frame_threshold, 20);
        assert!((config.vad.sensitivity - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.ollama.max_history, 30);
        assert_eq!(config.ollama.compress_interval, 20);
        assert_eq!(config.worker_counter_start, 1);
        assert_eq!(config.user_name, "unknown");
    }

    #[test]
    fn lead_ring_covers_two_seconds() {
        let audio = AudioConfig::default();
        // 16000 / 512 * 2 = 62 frames ≈ 2s of pre-speech audio.
        assert_eq!(audio.lead_ring_frames(), 62);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            user_name = "玉超"

            [vad]
            sensitivity = 0.8

            [ollama]
            model = "deepseek-r1"

            [speaker_voices]
            "钟离" = "resources/voice/zhongli.wav"
            "unknown" = "resources/voice/default.wav"
            "#,
        )
        .expect("parse partial config");

        assert_eq!(config.user_name, "玉超");
        assert!((config.vad.sensitivity - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.ollama.model, "deepseek-r1");
        // Untouched sections keep their defaults.
        assert_eq!(config.audio.chunk, 512);
        assert_eq!(
            config.voice_for_speaker("温迪").map(|p| p.to_owned()),
            Some(PathBuf::from("resources/voice/default.wav"))
        );
        assert_eq!(
            config.voice_for_speaker("钟离").map(|p| p.to_owned()),
            Some(PathBuf::from("resources/voice/zhongli.wav"))
        );
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = PipelineConfig::from_file(Path::new("/nonexistent/voxloop.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_or_default_falls_back() {
        let config = PipelineConfig::load_or_default(Path::new("/nonexistent/voxloop.toml"));
        assert_eq!(config.ollama.model, "gemma3:27b");
    }
}
