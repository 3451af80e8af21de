//! Voice activity gating for the capture stage.
//!
//! A [`SpeechModel`] scores each frame with a speech probability; the
//! [`VadGate`] turns the per-frame scores into speech-start / speech-end
//! edges, and the [`VadController`] owns the dynamic threshold — raised
//! while playback is active so the microphone does not trigger on the
//! system's own voice.

use crate::error::Result;
use crate::pipeline::messages::AudioFrame;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper clamp for the raised playback threshold.
const MAX_PLAY_THRESHOLD: f32 = 0.95;

/// Scores a frame with the posterior probability that it contains speech.
///
/// The production model is an external neural VAD; the shipped default
/// estimates the probability from frame energy.
pub trait SpeechModel {
    fn predict(&mut self, frame: &AudioFrame) -> Result<f32>;
}

/// Energy-based speech probability estimate.
///
/// Maps frame RMS linearly onto [0, 1], saturating at `full_scale_rms`.
#[derive(Debug, Clone, Copy)]
pub struct EnergyModel {
    full_scale_rms: f32,
}

impl EnergyModel {
    pub fn new(full_scale_rms: f32) -> Self {
        Self { full_scale_rms }
    }
}

impl Default for EnergyModel {
    fn default() -> Self {
        // 0.05 RMS is loud, close speech on f32 samples in [-1, 1].
        Self::new(0.05)
    }
}

impl SpeechModel for EnergyModel {
    fn predict(&mut self, frame: &AudioFrame) -> Result<f32> {
        if frame.samples.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f32 = frame.samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / frame.samples.len() as f32).sqrt();
        Ok((rms / self.full_scale_rms).clamp(0.0, 1.0))
    }
}

/// Commands applied asynchronously to the controller state.
enum VadCommand {
    SetPlaying(bool),
    SetSensitivity(f32),
}

#[derive(Debug)]
struct ControlState {
    sensitivity: f32,
    play_sensitivity_factor: f32,
    is_playing: bool,
}

/// Shared, thread-safe threshold controller.
///
/// Mutations go through a command channel serviced by a background worker;
/// readers take the lock once per frame, so each frame sees one consistent
/// threshold.
#[derive(Clone)]
pub struct VadController {
    state: Arc<Mutex<ControlState>>,
    cmd_tx: crossbeam_channel::Sender<VadCommand>,
}

impl VadController {
    pub fn new(sensitivity: f32, play_sensitivity_factor: f32) -> Self {
        let state = Arc::new(Mutex::new(ControlState {
            sensitivity: sensitivity.clamp(0.0, 1.0),
            play_sensitivity_factor,
            is_playing: false,
        }));
        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded::<VadCommand>(32);

        let worker_state = Arc::clone(&state);
        std::thread::spawn(move || loop {
            match cmd_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(cmd) => {
                    let Ok(mut state) = worker_state.lock() else {
                        error!("VAD controller state poisoned, stopping worker");
                        break;
                    };
                    match cmd {
                        VadCommand::SetPlaying(playing) => state.is_playing = playing,
                        VadCommand::SetSensitivity(value) => {
                            state.sensitivity = value.clamp(0.0, 1.0);
                            info!("VAD sensitivity set to {}", state.sensitivity);
                        }
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        });

        Self { state, cmd_tx }
    }

    /// Mark playback active/inactive (called by the playback worker).
    pub fn set_playing(&self, playing: bool) {
        if self.cmd_tx.try_send(VadCommand::SetPlaying(playing)).is_err() {
            warn!("VAD controller command queue full, dropping set_playing");
        }
    }

    /// Change the base sensitivity (clamped to [0, 1]).
    pub fn set_sensitivity(&self, value: f32) {
        if self
            .cmd_tx
            .try_send(VadCommand::SetSensitivity(value))
            .is_err()
        {
            warn!("VAD controller command queue full, dropping set_sensitivity");
        }
    }

    /// Effective threshold for the current frame.
    ///
    /// While playback is active, the base sensitivity is raised by
    /// `play_sensitivity_factor`, clamped to 0.95.
    pub fn get_threshold(&self) -> f32 {
        match self.state.lock() {
            Ok(state) => {
                if state.is_playing {
                    (state.sensitivity + state.play_sensitivity_factor).min(MAX_PLAY_THRESHOLD)
                } else {
                    state.sensitivity
                }
            }
            Err(_) => {
                error!("VAD controller state poisoned, using max threshold");
                MAX_PLAY_THRESHOLD
            }
        }
    }
}

/// Edge emitted by the gate for a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    None,
    /// First speech frame after silence.
    SpeechStart,
    /// `silence_frame_threshold` consecutive non-speech frames elapsed.
    SpeechEnd,
}

/// Per-frame gate decision.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    pub probability: f32,
    pub is_speech: bool,
    pub edge: VadEdge,
}

/// Speech boundary detector over per-frame probabilities.
pub struct VadGate {
    model: Box<dyn SpeechModel + Send>,
    controller: VadController,
    silence_frame_threshold: u32,
    in_speech: bool,
    silence_frames: u32,
}

impl VadGate {
    pub fn new(
        model: Box<dyn SpeechModel + Send>,
        controller: VadController,
        silence_frame_threshold: u32,
    ) -> Self {
        Self {
            model,
            controller,
            silence_frame_threshold,
            in_speech: false,
            silence_frames: 0,
        }
    }

    /// Classify one frame and advance the boundary state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying model fails.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        let probability = self.model.predict(frame)?;
        let threshold = self.controller.get_threshold();
        let is_speech = probability > threshold;

        let edge = if is_speech {
            self.silence_frames = 0;
            if self.in_speech {
                VadEdge::None
            } else {
                self.in_speech = true;
                info!("speech started (p={probability:.3}, threshold={threshold:.3})");
                VadEdge::SpeechStart
            }
        } else if self.in_speech {
            self.silence_frames += 1;
            if self.silence_frames >= self.silence_frame_threshold {
                self.in_speech = false;
                self.silence_frames = 0;
                VadEdge::SpeechEnd
            } else {
                VadEdge::None
            }
        } else {
            VadEdge::None
        };

        Ok(VadDecision {
            probability,
            is_speech,
            edge,
        })
    }

    /// Whether the gate is currently inside a speech segment.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }
}
