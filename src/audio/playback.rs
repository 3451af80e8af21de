//! Sequential, interruptible playback of synthesized artifacts.
//!
//! The worker owns the single active output stream. During playback the
//! barge-in flag is polled every ~10ms; a raise stops the device
//! immediately, the flag is cleared, and the worker moves on. The VAD
//! controller is notified around each artifact so the capture threshold is
//! raised while the speaker is live.

use crate::config::AudioConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::barge_in::BargeIn;
use crate::pipeline::messages::AudioArtifact;
use crate::vad::VadController;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Barge-in poll interval during playback.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How one playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    /// Stopped early by barge-in; the flag has been cleared.
    Interrupted,
}

/// Plays one artifact, polling the barge-in flag while audio is live.
///
/// Seam for the playback worker so the ordering semantics are testable
/// without an audio device.
pub trait ArtifactPlayer {
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be decoded or played.
    fn play(&mut self, artifact: &AudioArtifact, barge_in: &BargeIn) -> Result<PlayOutcome>;
}

/// Speaker output via cpal.
pub struct CpalPlayer {
    device: cpal::Device,
}

impl CpalPlayer {
    /// # Errors
    ///
    /// Returns an error if no usable output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| SpeechError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| SpeechError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| SpeechError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self { device })
    }
}

/// Shared buffer advanced by the output callback.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

impl ArtifactPlayer for CpalPlayer {
    fn play(&mut self, artifact: &AudioArtifact, barge_in: &BargeIn) -> Result<PlayOutcome> {
        let (samples, sample_rate) = read_wav_samples(&artifact.path)?;

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples,
            position: 0,
            finished: false,
        }));
        let buffer_clone = Arc::clone(&buffer);

        let stream = self
            .device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let Ok(mut buf) = buffer_clone.lock() else {
                        return;
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| SpeechError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SpeechError::Audio(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(POLL_INTERVAL);

            if barge_in.is_raised() {
                drop(stream);
                barge_in.clear();
                info!(seq = artifact.sequence_no, "playback interrupted");
                return Ok(PlayOutcome::Interrupted);
            }

            let finished = buffer
                .lock()
                .map(|buf| buf.finished)
                .map_err(|e| SpeechError::Audio(format!("playback buffer poisoned: {e}")))?;
            if finished {
                break;
            }
        }

        drop(stream);
        Ok(PlayOutcome::Completed)
    }
}

/// Decode a WAV into mono f32 samples.
fn read_wav_samples(path: &std::path::Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| SpeechError::Audio(format!("cannot read WAV: {e}")))?;
    let spec = reader.spec();

    let raw: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SpeechError::Audio(format!("cannot decode WAV: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = 1.0f32 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| SpeechError::Audio(format!("cannot decode WAV: {e}")))?
        }
    };

    let samples = if spec.channels > 1 {
        let ch = spec.channels as usize;
        raw.chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    } else {
        raw
    };

    Ok((samples, spec.sample_rate))
}

/// Worker loop: audio queue → device, in sequence order.
///
/// A raised flag seen at dequeue time means the artifact belongs to an
/// interrupted turn: it is skipped and the flag cleared. Playback errors
/// skip the artifact and keep the worker alive.
pub fn run_playback_worker<P: ArtifactPlayer>(
    mut player: P,
    audio_rx: crossbeam_channel::Receiver<AudioArtifact>,
    barge_in: BargeIn,
    vad_controller: VadController,
    cancel: CancellationToken,
) {
    info!("playback worker started");
    loop {
        match audio_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(artifact) => {
                if barge_in.is_raised() {
                    info!(seq = artifact.sequence_no, "skipping artifact (barge-in)");
                    barge_in.clear();
                    continue;
                }

                vad_controller.set_playing(true);
                match player.play(&artifact, &barge_in) {
                    Ok(PlayOutcome::Completed) => {}
                    Ok(PlayOutcome::Interrupted) => {
                        info!("stopped mid-artifact, waiting for next turn");
                    }
                    Err(e) => error!("playback failed, skipping artifact: {e}"),
                }
                vad_controller.set_playing(false);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("playback worker stopped");
}
