//! Microphone capture and utterance assembly.
//!
//! [`CpalCapture`] reads from the system microphone at the device's native
//! rate and re-frames to fixed-size mono chunks at the pipeline rate.
//! [`UtteranceBuilder`] carves utterances out of the frame stream using the
//! VAD gate's edges: a rolling pre-speech ring supplies the lead buffer so
//! the onset is not clipped, and the recording ends on the silence edge.

use crate::config::AudioConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::{AudioFrame, Utterance};
use crate::vad::{VadDecision, VadEdge};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Microphone capture via cpal.
///
/// Uses the device's default configuration for compatibility and
/// downsamples to the configured pipeline rate in software.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    target_chunk_frames: usize,
}

impl CpalCapture {
    /// # Errors
    ///
    /// Returns an error if no usable input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            let requested = host
                .input_devices()
                .map_err(|e| SpeechError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| match d.description() {
                    Ok(desc) => desc.name() == name,
                    Err(_) => false,
                });
            match requested {
                Some(device) => device,
                None => {
                    warn!("input device '{name}' not found, using default");
                    host.default_input_device()
                        .ok_or_else(|| SpeechError::Audio("no default input device".into()))?
                }
            }
        } else {
            host.default_input_device()
                .ok_or_else(|| SpeechError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| SpeechError::Audio(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            stream_config.sample_rate, stream_config.channels
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.rate,
            target_chunk_frames: config.chunk.max(1) as usize,
        })
    }

    /// Run the capture loop, sending fixed-size frames until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be created or started —
    /// fatal for the capture thread; the supervisor terminates the pipeline.
    pub async fn run(&self, tx: mpsc::Sender<AudioFrame>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let chunk_len = self.target_chunk_frames;
        let mut pending: VecDeque<f32> = VecDeque::with_capacity(chunk_len.saturating_mul(4));
        let tx_closed = AtomicBool::new(false);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    pending.extend(samples);

                    while pending.len() >= chunk_len {
                        if tx_closed.load(Ordering::Relaxed) {
                            pending.clear();
                            break;
                        }
                        let frame = AudioFrame {
                            samples: pending.drain(..chunk_len).collect(),
                            sample_rate: target_rate,
                        };
                        // try_send keeps the audio callback non-blocking.
                        match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("frame channel full, dropping frame");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tx_closed.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| SpeechError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SpeechError::Audio(format!("failed to start input stream: {e}")))?;

        info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");

        cancel.cancelled().await;
        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler. Speech energy sits below 8kHz, so no
/// anti-alias filter is needed for 48kHz → 16kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}

/// Capture-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Listening,
    Recording,
}

/// Assembles utterances from the frame stream and VAD edges.
pub struct UtteranceBuilder {
    state: CaptureState,
    /// Rolling window of the most recent pre-speech frames (~2s).
    ring: VecDeque<AudioFrame>,
    ring_capacity: usize,
    lead: Vec<AudioFrame>,
    recorded: Vec<AudioFrame>,
    sample_rate: u32,
}

impl UtteranceBuilder {
    pub fn new(config: &AudioConfig) -> Self {
        let ring_capacity = config.lead_ring_frames();
        Self {
            state: CaptureState::Listening,
            ring: VecDeque::with_capacity(ring_capacity),
            ring_capacity,
            lead: Vec::new(),
            recorded: Vec::new(),
            sample_rate: config.rate,
        }
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    /// Advance on one frame + its gate decision. Returns the assembled
    /// utterance when the silence edge closes a recording.
    pub fn on_frame(&mut self, frame: AudioFrame, decision: &VadDecision) -> Option<Utterance> {
        match self.state {
            CaptureState::Listening => {
                if decision.edge == VadEdge::SpeechStart {
                    // Snapshot the ring as the lead buffer so the utterance
                    // keeps the onset that preceded the detection.
                    self.lead = self.ring.iter().cloned().collect();
                    self.ring.clear();
                    self.recorded = vec![frame];
                    self.state = CaptureState::Recording;
                } else {
                    self.ring.push_back(frame);
                    while self.ring.len() > self.ring_capacity {
                        let _ = self.ring.pop_front();
                    }
                }
                None
            }
            CaptureState::Recording => {
                self.recorded.push(frame);
                if decision.edge == VadEdge::SpeechEnd {
                    let mut samples = Vec::new();
                    for f in self.lead.drain(..).chain(self.recorded.drain(..)) {
                        samples.extend(f.samples);
                    }
                    self.state = CaptureState::Listening;
                    return Some(Utterance {
                        samples,
                        sample_rate: self.sample_rate,
                    });
                }
                None
            }
        }
    }
}

/// Serialize an utterance to a 16-bit PCM mono WAV for the ASR.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_utterance_wav(path: &Path, utterance: &Utterance) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: utterance.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| SpeechError::Audio(format!("cannot create WAV: {e}")))?;
    for sample in &utterance.samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer
            .write_sample(value)
            .map_err(|e| SpeechError::Audio(format!("cannot write WAV: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| SpeechError::Audio(format!("cannot finalize WAV: {e}")))?;
    Ok(())
}
