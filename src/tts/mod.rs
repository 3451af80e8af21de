//! Speech synthesis worker.
//!
//! Pulls `(text, speaker)` jobs off the text queue, resolves the speaker's
//! reference voice, synthesizes a WAV into the cache directory, and
//! publishes the artifact to the audio queue. Output that is mostly
//! silence (a known backend failure mode) is re-synthesized before it is
//! allowed downstream.

use crate::config::{PipelineConfig, SilenceDetectionConfig, TtsConfig};
use crate::error::{Result, SpeechError};
use crate::pipeline::barge_in::BargeIn;
use crate::pipeline::messages::{AudioArtifact, TtsJob};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Window size used when scanning a WAV for silence.
const SILENCE_WINDOW_MS: u32 = 10;

/// Fraction of silent duration above which output is re-synthesized.
const MAX_SILENCE_RATIO: f64 = 0.5;

/// Synthesizes text into a WAV on disk using a reference voice sample.
///
/// At most one synthesis runs at a time; the worker enforces this by
/// construction.
pub trait Synthesizer {
    fn synthesize(&mut self, text: &str, voice_ref: &Path, out_path: &Path) -> Result<()>;
}

/// HTTP adapter for a local synthesis server.
///
/// Sends `{"text", "voice", "model_dir", "cfg_path", "kwargs"}` and writes
/// the returned WAV bytes to `out_path`.
pub struct HttpTts {
    config: TtsConfig,
    agent: ureq::Agent,
}

impl HttpTts {
    pub fn new(config: &TtsConfig) -> Self {
        info!("TTS backend configured: {}", config.endpoint);
        Self {
            config: config.clone(),
            agent: ureq::agent(),
        }
    }
}

impl Synthesizer for HttpTts {
    fn synthesize(&mut self, text: &str, voice_ref: &Path, out_path: &Path) -> Result<()> {
        let body = serde_json::json!({
            "text": text,
            "voice": voice_ref.to_string_lossy(),
            "model_dir": self.config.model_dir,
            "cfg_path": self.config.cfg_path,
            "kwargs": self.config.kwargs,
        });

        let response = self
            .agent
            .post(&self.config.endpoint)
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .map_err(|e| SpeechError::Tts(format!("synthesis request failed: {e}")))?;

        let mut wav_bytes = Vec::new();
        std::io::Read::read_to_end(&mut response.into_reader(), &mut wav_bytes)
            .map_err(|e| SpeechError::Tts(format!("failed to read synthesis response: {e}")))?;

        std::fs::write(out_path, wav_bytes)?;
        Ok(())
    }
}

/// Sequentially numbered synthesis worker state.
pub struct TtsWorker {
    synthesizer: Box<dyn Synthesizer + Send>,
    voices: HashMap<String, PathBuf>,
    cache_dir: PathBuf,
    silence: SilenceDetectionConfig,
    sequence: u64,
}

impl TtsWorker {
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(config: &PipelineConfig, synthesizer: Box<dyn Synthesizer + Send>) -> Result<Self> {
        std::fs::create_dir_all(&config.tts.cache_dir)?;
        Ok(Self {
            synthesizer,
            voices: config.speaker_voices.clone(),
            cache_dir: config.tts.cache_dir.clone(),
            silence: config.silence_detection.clone(),
            sequence: config.worker_counter_start,
        })
    }

    /// Synthesize one job into a uniquely named cache WAV.
    ///
    /// Retries while the output is mostly silent. The artifact filename is
    /// `NNNN_<uuid>.wav` with a zero-padded monotonic sequence prefix that
    /// defines playback order.
    ///
    /// # Errors
    ///
    /// Returns an error if the speaker has no voice mapping (not even the
    /// `unknown` fallback) or synthesis fails.
    pub fn synthesize_job(&mut self, job: &TtsJob) -> Result<AudioArtifact> {
        let voice = self
            .voices
            .get(&job.speaker)
            .or_else(|| self.voices.get("unknown"))
            .ok_or_else(|| {
                SpeechError::Tts(format!("no voice for speaker '{}' and no fallback", job.speaker))
            })?
            .clone();

        let filename = format!("{:04}_{}.wav", self.sequence, Uuid::new_v4());
        let path = self.cache_dir.join(filename);

        info!("synthesizing for {}: \"{}\"", job.speaker, job.text);
        self.synthesizer.synthesize(&job.text, &voice, &path)?;

        loop {
            let ratio = silence_ratio(&path, &self.silence)?;
            if ratio <= MAX_SILENCE_RATIO {
                break;
            }
            warn!(
                "synthesized audio is {:.0}% silent, re-synthesizing",
                ratio * 100.0
            );
            self.synthesizer.synthesize(&job.text, &voice, &path)?;
        }

        let artifact = AudioArtifact {
            path,
            sequence_no: self.sequence,
            speaker: job.speaker.clone(),
        };
        self.sequence += 1;
        Ok(artifact)
    }
}

/// Worker loop: text queue → synthesis → audio queue.
///
/// Queue reads use a short timeout so shutdown is never blocked. When the
/// barge-in flag is up, finished output is discarded instead of queued —
/// synthesis is never aborted mid-flight, dropping the result is cheaper.
pub fn run_tts_worker(
    mut worker: TtsWorker,
    text_rx: crossbeam_channel::Receiver<TtsJob>,
    audio_tx: crossbeam_channel::Sender<AudioArtifact>,
    barge_in: BargeIn,
    cancel: CancellationToken,
) {
    info!("TTS worker started");
    'worker: loop {
        match text_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                if barge_in.is_raised() {
                    info!("dropping queued synthesis job (barge-in)");
                    continue;
                }
                match worker.synthesize_job(&job) {
                    Ok(mut artifact) => loop {
                        if barge_in.is_raised() || cancel.is_cancelled() {
                            info!(seq = artifact.sequence_no, "discarding synthesized artifact");
                            break;
                        }
                        match audio_tx.send_timeout(artifact, Duration::from_millis(100)) {
                            Ok(()) => break,
                            Err(crossbeam_channel::SendTimeoutError::Timeout(returned)) => {
                                artifact = returned;
                            }
                            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                                break 'worker;
                            }
                        }
                    },
                    Err(e) => error!("synthesis failed, skipping segment: {e}"),
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("TTS worker stopped");
}

/// Fraction of a WAV's duration covered by silence runs.
///
/// A window is silent when its RMS level is below `silence_threshold`
/// dBFS; only contiguous silent stretches of at least `min_silence_len` ms
/// count towards the total.
pub fn silence_ratio(path: &Path, config: &SilenceDetectionConfig) -> Result<f64> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| SpeechError::Tts(format!("cannot read WAV: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SpeechError::Tts(format!("cannot decode WAV: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = 1.0f32 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| SpeechError::Tts(format!("cannot decode WAV: {e}")))?
        }
    };

    if samples.is_empty() {
        return Ok(0.0);
    }

    // Collapse to mono window RMS over fixed 10ms windows.
    let channels = spec.channels.max(1) as usize;
    let window_samples = (spec.sample_rate as usize * SILENCE_WINDOW_MS as usize / 1000).max(1);
    let frame = window_samples * channels;
    let min_silent_windows =
        (config.min_silence_len / SILENCE_WINDOW_MS).max(1) as usize;

    let mut silent_windows = 0usize;
    let mut run = 0usize;
    let mut total_windows = 0usize;
    for window in samples.chunks(frame) {
        total_windows += 1;
        let sum_sq: f32 = window.iter().map(|s| s * s).sum();
        let rms = (sum_sq / window.len() as f32).sqrt();
        let dbfs = if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            f32::NEG_INFINITY
        };
        if dbfs < config.silence_threshold {
            run += 1;
        } else {
            if run >= min_silent_windows {
                silent_windows += run;
            }
            run = 0;
        }
    }
    if run >= min_silent_windows {
        silent_windows += run;
    }

    Ok(silent_windows as f64 / total_windows as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Writes a mono 16kHz WAV with the given amplitude per second-long half.
    fn write_wav(path: &Path, loud_secs: f32, silent_secs: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        let loud = (16_000.0 * loud_secs) as usize;
        let silent = (16_000.0 * silent_secs) as usize;
        for n in 0..loud {
            let value = (f64::from(n as u32) * 0.1).sin() * 0.5;
            writer
                .write_sample((value * f64::from(i16::MAX)) as i16)
                .expect("write sample");
        }
        for _ in 0..silent {
            writer.write_sample(0i16).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }

    /// Synthesizer that writes WAVs from a script of (loud, silent) pairs.
    struct ScriptedSynth {
        script: Vec<(f32, f32)>,
        calls: Arc<AtomicUsize>,
    }

    impl Synthesizer for ScriptedSynth {
        fn synthesize(&mut self, _text: &str, _voice: &Path, out_path: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (loud, silent) = self.script[call.min(self.script.len() - 1)];
            write_wav(out_path, loud, silent);
            Ok(())
        }
    }

    fn test_config(cache_dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.tts.cache_dir = cache_dir.to_owned();
        config
            .speaker_voices
            .insert("钟离".to_owned(), PathBuf::from("voices/zhongli.wav"));
        config
    }

    #[test]
    fn artifacts_are_sequentially_numbered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));
        let synth = ScriptedSynth {
            script: vec![(1.0, 0.0)],
            calls: Arc::clone(&calls),
        };
        let mut worker = TtsWorker::new(&test_config(dir.path()), Box::new(synth)).expect("worker");

        let job = TtsJob {
            text: "你好。".to_owned(),
            speaker: "钟离".to_owned(),
        };
        let first = worker.synthesize_job(&job).expect("first artifact");
        let second = worker.synthesize_job(&job).expect("second artifact");

        assert_eq!(first.sequence_no, 1);
        assert_eq!(second.sequence_no, 2);
        let name = first.path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(name.starts_with("0001_"), "unexpected name {name}");
        assert!(name.ends_with(".wav"));
        assert!(first.path.exists());
    }

    #[test]
    fn silent_output_is_resynthesized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));
        let synth = ScriptedSynth {
            // First attempt almost entirely silent, second attempt fine.
            script: vec![(0.2, 1.8), (1.0, 0.0)],
            calls: Arc::clone(&calls),
        };
        let mut worker = TtsWorker::new(&test_config(dir.path()), Box::new(synth)).expect("worker");

        let job = TtsJob {
            text: "你好。".to_owned(),
            speaker: "钟离".to_owned(),
        };
        let artifact = worker.synthesize_job(&job).expect("artifact");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let ratio = silence_ratio(&artifact.path, &SilenceDetectionConfig::default())
            .expect("silence ratio");
        assert!(ratio <= MAX_SILENCE_RATIO);
    }

    #[test]
    fn unmapped_speaker_falls_back_to_unknown_voice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));
        let synth = ScriptedSynth {
            script: vec![(1.0, 0.0)],
            calls: Arc::clone(&calls),
        };
        let mut worker = TtsWorker::new(&test_config(dir.path()), Box::new(synth)).expect("worker");

        let job = TtsJob {
            text: "好。".to_owned(),
            speaker: "陌生人".to_owned(),
        };
        assert!(worker.synthesize_job(&job).is_ok());
    }

    #[test]
    fn silence_ratio_flags_mostly_silent_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("silent.wav");
        write_wav(&path, 0.5, 1.5);

        let ratio = silence_ratio(&path, &SilenceDetectionConfig::default()).expect("ratio");
        assert!(ratio > MAX_SILENCE_RATIO, "ratio {ratio}");
    }

    #[test]
    fn silence_ratio_ignores_short_gaps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gappy.wav");
        // 100ms silent gap is below the 1000ms default minimum run length.
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
        for n in 0..16_000 {
            let silent_gap = (7_000..8_600).contains(&n);
            let value = if silent_gap {
                0.0
            } else {
                (f64::from(n as u32) * 0.1).sin() * 0.5
            };
            writer
                .write_sample((value * f64::from(i16::MAX)) as i16)
                .expect("write sample");
        }
        writer.finalize().expect("finalize wav");

        let ratio = silence_ratio(&path, &SilenceDetectionConfig::default()).expect("ratio");
        assert_eq!(ratio, 0.0);
    }
}
