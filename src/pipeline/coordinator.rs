//! Main pipeline orchestrator that wires all stages together.
//!
//! Data flow: mic → capture → VAD gate → utterance → ASR → transcript →
//! dispatcher → LLM stream → segmenter → text queue → TTS worker → audio
//! queue → playback. Control flow: the VAD gate's speech-start edge raises
//! the barge-in flag (the only producer), a supervisor-side handler drains
//! both queues, the LLM stream stops between chunks, and playback stops
//! within one 10ms poll.
//!
//! Per user turn the pipeline passes through Idle → UserSpeaking →
//! Transcribing → Generating → interleaved Synthesizing/Playing → Idle;
//! a fresh speech onset preempts everything from Generating onward.

use crate::asr::{AsrAdapter, HttpAsr};
use crate::audio::capture::{CpalCapture, UtteranceBuilder, write_utterance_wav};
use crate::audio::playback::{CpalPlayer, run_playback_worker};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::history::ChatHistory;
use crate::llm::OllamaClient;
use crate::pipeline::barge_in::{BargeIn, drain_queue};
use crate::pipeline::messages::{
    AudioFrame, ChunkEvent, ControlEvent, Role, SegmentEvent, SegmentKind, TtsJob, Utterance,
};
use crate::segmenter::SpeechSegmenter;
use crate::tts::{HttpTts, TtsWorker, run_tts_worker};
use crate::vad::{EnergyModel, VadController, VadEdge, VadGate};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Channel buffer sizes.
const FRAME_CHANNEL_SIZE: usize = 64;
/// Single-slot utterance hand-off: back-pressure stalls capture-side
/// assembly while recognition is busy.
const UTTERANCE_CHANNEL_SIZE: usize = 1;
const TRANSCRIPT_CHANNEL_SIZE: usize = 8;
const KEYBOARD_CHANNEL_SIZE: usize = 8;
const TEXT_QUEUE_SIZE: usize = 64;
const AUDIO_QUEUE_SIZE: usize = 16;

/// Parsed line from the interactive prompt.
#[derive(Debug, Clone, PartialEq)]
enum InputCommand {
    Quit,
    SetSensitivity(f32),
    Say(String),
    Empty,
}

fn parse_input_line(line: &str) -> InputCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return InputCommand::Empty;
    }
    if matches!(trimmed, "q" | "quit" | "exit") {
        return InputCommand::Quit;
    }
    if let Some(rest) = trimmed.strip_prefix('v')
        && let Ok(value) = rest.trim().parse::<f32>()
        && (0.0..=1.0).contains(&value)
    {
        return InputCommand::SetSensitivity(value);
    }
    InputCommand::Say(trimmed.to_owned())
}

/// Orchestrates the full voice pipeline.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    cancel: CancellationToken,
    barge_in: BargeIn,
    vad_controller: VadController,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig) -> Self {
        let vad_controller =
            VadController::new(config.vad.sensitivity, config.vad.play_sensitivity_factor);
        Self {
            config,
            cancel: CancellationToken::new(),
            barge_in: BargeIn::new(),
            vad_controller,
        }
    }

    /// Request graceful shutdown of the pipeline.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Get a clone of the cancellation token for external use.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker fails to initialize.
    pub async fn run(self) -> Result<()> {
        info!("initializing voice pipeline");

        let cancel = self.cancel.clone();
        let barge_in = self.barge_in.clone();
        let vad_controller = self.vad_controller.clone();
        let config = self.config;

        // Inter-stage channels. The text and audio queues are MPMC so the
        // barge-in handler can drain them from outside the workers.
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_SIZE);
        let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(UTTERANCE_CHANNEL_SIZE);
        let (transcript_tx, transcript_rx) = mpsc::channel::<String>(TRANSCRIPT_CHANNEL_SIZE);
        let (keyboard_tx, keyboard_rx) = mpsc::channel::<String>(KEYBOARD_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlEvent>();
        let (text_tx, text_rx) = crossbeam_channel::bounded::<TtsJob>(TEXT_QUEUE_SIZE);
        let (audio_tx, audio_rx) = crossbeam_channel::bounded(AUDIO_QUEUE_SIZE);

        // Capture: mic frames in, fatal errors terminate the pipeline.
        let capture_handle = {
            let config = config.audio.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match CpalCapture::new(&config) {
                    Ok(capture) => {
                        if let Err(e) = capture.run(frame_tx, cancel.clone()).await {
                            error!("capture failed, terminating pipeline: {e}");
                            cancel.cancel();
                        }
                    }
                    Err(e) => {
                        error!("failed to init capture, terminating pipeline: {e}");
                        cancel.cancel();
                    }
                }
            })
        };

        // VAD gate + utterance assembly; raises barge-in on speech onset.
        let vad_handle = {
            let config = config.clone();
            let cancel = cancel.clone();
            let barge_in = barge_in.clone();
            let vad_controller = vad_controller.clone();
            tokio::spawn(async move {
                run_vad_stage(
                    &config,
                    frame_rx,
                    utterance_tx,
                    control_tx,
                    barge_in,
                    vad_controller,
                    cancel,
                )
                .await;
            })
        };

        // ASR: one utterance at a time against the recognition backend.
        let asr_handle = {
            let config = config.clone();
            let cancel = cancel.clone();
            let adapter = Box::new(HttpAsr::new(&config.asr));
            tokio::spawn(async move {
                run_asr_stage(&config, adapter, utterance_rx, transcript_tx, cancel).await;
            })
        };

        // Barge-in handler: one place drains both queues on a raise.
        let barge_in_handle = {
            let cancel = cancel.clone();
            let text_rx = text_rx.clone();
            let audio_rx = audio_rx.clone();
            tokio::spawn(async move {
                run_barge_in_handler(control_rx, text_rx, audio_rx, cancel).await;
            })
        };

        // TTS worker: text queue → synthesized artifacts.
        let tts_worker = TtsWorker::new(&config, Box::new(HttpTts::new(&config.tts)))?;
        let tts_handle = {
            let barge_in = barge_in.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                run_tts_worker(tts_worker, text_rx, audio_tx, barge_in, cancel);
            })
        };

        // Playback worker: owns the one active output stream.
        let playback_handle = {
            let config = config.audio.clone();
            let barge_in = barge_in.clone();
            let vad_controller = vad_controller.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || match CpalPlayer::new(&config) {
                Ok(player) => {
                    run_playback_worker(player, audio_rx, barge_in, vad_controller, cancel);
                }
                Err(e) => error!("failed to init playback: {e}"),
            })
        };

        // Keyboard input: interactive prompt on stdin.
        let keyboard_handle = {
            let cancel = cancel.clone();
            let vad_controller = vad_controller.clone();
            tokio::task::spawn_blocking(move || {
                run_keyboard_loop(keyboard_tx, vad_controller, cancel);
            })
        };

        // Dispatcher: voice and keyboard inputs share one turn routine.
        let dispatch_handle = {
            let config = config.clone();
            let cancel = cancel.clone();
            let barge_in = barge_in.clone();
            tokio::spawn(async move {
                run_dispatch_stage(&config, transcript_rx, keyboard_rx, text_tx, barge_in, cancel)
                    .await;
            })
        };

        cancel.cancelled().await;
        info!("pipeline shutting down");

        let _ = tokio::join!(
            capture_handle,
            vad_handle,
            asr_handle,
            barge_in_handle,
            tts_handle,
            playback_handle,
            keyboard_handle,
            dispatch_handle,
        );

        info!("pipeline shutdown complete");
        Ok(())
    }
}

// -- Stage runner functions --

async fn run_vad_stage(
    config: &PipelineConfig,
    mut frame_rx: mpsc::Receiver<AudioFrame>,
    utterance_tx: mpsc::Sender<Utterance>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    barge_in: BargeIn,
    vad_controller: VadController,
    cancel: CancellationToken,
) {
    let mut gate = VadGate::new(
        Box::new(EnergyModel::default()),
        vad_controller,
        config.audio.silence_frame_threshold,
    );
    let mut builder = UtteranceBuilder::new(&config.audio);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                match gate.process_frame(&frame) {
                    Ok(decision) => {
                        if decision.edge == VadEdge::SpeechStart {
                            // The one place barge-in originates.
                            if barge_in.raise() {
                                info!("user speech onset, barge-in raised");
                            }
                            let _ = control_tx.send(ControlEvent::UserSpeechStart);
                        }
                        if let Some(utterance) = builder.on_frame(frame, &decision) {
                            info!("utterance captured: {:.1}s", utterance.duration_secs());
                            if utterance_tx.send(utterance).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => error!("VAD error: {e}"),
                }
            }
        }
    }
}

async fn run_asr_stage(
    config: &PipelineConfig,
    adapter: Box<dyn AsrAdapter + Send>,
    mut utterance_rx: mpsc::Receiver<Utterance>,
    transcript_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    if let Err(e) = std::fs::create_dir_all(&config.tts.cache_dir) {
        error!("cannot create cache dir: {e}");
        return;
    }
    // Single scratch slot; the stage serializes recognition, so the file is
    // never rewritten while the backend reads it.
    let scratch = config.tts.cache_dir.join("utterance.wav");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            utterance = utterance_rx.recv() => {
                let Some(utterance) = utterance else { break };
                if let Err(e) = write_utterance_wav(&scratch, &utterance) {
                    error!("cannot write utterance WAV: {e}");
                    continue;
                }
                match adapter.transcribe(&scratch, &config.asr.language, &config.asr_prompt) {
                    Ok(text) if !text.trim().is_empty() => {
                        info!("recognized: \"{text}\"");
                        if transcript_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => info!("empty transcript, resuming listening"),
                    Err(e) => error!("recognition failed, dropping utterance: {e}"),
                }
            }
        }
    }
}

async fn run_barge_in_handler(
    mut control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    text_rx: crossbeam_channel::Receiver<TtsJob>,
    audio_rx: crossbeam_channel::Receiver<crate::pipeline::messages::AudioArtifact>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = control_rx.recv() => {
                let Some(ControlEvent::UserSpeechStart) = event else { break };
                let dropped_text = drain_queue(&text_rx);
                let dropped_audio = drain_queue(&audio_rx);
                if dropped_text + dropped_audio > 0 {
                    info!(dropped_text, dropped_audio, "drained queues after barge-in");
                }
            }
        }
    }
}

fn run_keyboard_loop(
    input_tx: mpsc::Sender<String>,
    vad_controller: VadController,
    cancel: CancellationToken,
) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match parse_input_line(&line) {
                InputCommand::Quit => {
                    info!("quit requested");
                    cancel.cancel();
                    break;
                }
                InputCommand::SetSensitivity(value) => vad_controller.set_sensitivity(value),
                InputCommand::Say(text) => {
                    if input_tx.blocking_send(text).is_err() {
                        break;
                    }
                }
                InputCommand::Empty => {}
            },
            Err(e) => {
                error!("stdin read failed: {e}");
                break;
            }
        }
    }
}

async fn run_dispatch_stage(
    config: &PipelineConfig,
    mut transcript_rx: mpsc::Receiver<String>,
    keyboard_rx: mpsc::Receiver<String>,
    text_tx: crossbeam_channel::Sender<TtsJob>,
    barge_in: BargeIn,
    cancel: CancellationToken,
) {
    let mut llm = OllamaClient::new(&config.ollama, &config.ai_prompts);
    let mut history = ChatHistory::load(
        &config.ollama.history_path,
        config.ollama.max_history,
        config.ollama.compress_interval,
    );
    let mut keyboard_rx = Some(keyboard_rx);

    loop {
        let recv_keyboard = async {
            match keyboard_rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        let prompt = tokio::select! {
            () = cancel.cancelled() => break,
            transcript = transcript_rx.recv() => {
                let Some(t) = transcript else { break };
                t
            }
            typed = recv_keyboard => {
                match typed {
                    Some(t) => t,
                    None => {
                        // stdin closed; stay alive for voice input.
                        keyboard_rx = None;
                        continue;
                    }
                }
            }
        };

        dispatch_turn(config, &mut llm, &mut history, &prompt, &text_tx, &barge_in, &cancel)
            .await;
    }
}

/// One user turn: stream the reply, segment it, queue speech for
/// synthesis, then record the turn in history — also when the reply was
/// cut short, so partial replies stay in context.
async fn dispatch_turn(
    config: &PipelineConfig,
    llm: &mut OllamaClient,
    history: &mut ChatHistory,
    prompt: &str,
    text_tx: &crossbeam_channel::Sender<TtsJob>,
    barge_in: &BargeIn,
    cancel: &CancellationToken,
) {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return;
    }

    let mut rx = llm.stream_chat(
        prompt,
        &config.user_name,
        history.messages_for_model(),
        barge_in.clone(),
    );
    let mut segmenter = SpeechSegmenter::new();
    let mut response = String::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                match chunk {
                    ChunkEvent::Thinking(text) => {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    ChunkEvent::Response(text) => {
                        response.push_str(&text);
                        for event in segmenter.push(&text) {
                            route_segment(event, text_tx, barge_in, cancel);
                        }
                    }
                    ChunkEvent::Error(message) => {
                        error!("LLM backend error: {message}");
                        println!("[错误] {message}");
                    }
                }
            }
        }
    }

    for event in segmenter.flush() {
        route_segment(event, text_tx, barge_in, cancel);
    }

    history.append(Role::User, prompt);
    history.append(Role::Assistant, response.trim());
    history.maybe_compress(&*llm, &config.ai_prompts.summarize);
    if let Err(e) = history.save(&config.ollama.history_path) {
        warn!("cannot save history: {e}");
    }
}

/// Route one segment event: speech goes to the TTS queue, untagged text is
/// only shown. Nothing is queued once the turn has been barged in.
fn route_segment(
    event: SegmentEvent,
    text_tx: &crossbeam_channel::Sender<TtsJob>,
    barge_in: &BargeIn,
    cancel: &CancellationToken,
) {
    match event.kind {
        SegmentKind::Text => {
            println!("{}", event.content);
        }
        SegmentKind::Speech => {
            let speaker = event.speaker.unwrap_or_else(|| "unknown".to_owned());
            println!("[{speaker}] {}", event.content);
            let mut job = TtsJob {
                text: event.content,
                speaker,
            };
            loop {
                if barge_in.is_raised() || cancel.is_cancelled() {
                    return;
                }
                match text_tx.send_timeout(job, Duration::from_millis(100)) {
                    Ok(()) => return,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(returned)) => job = returned,
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                }
            }
        }
    }
}
