//! Barge-in signal shared across pipeline stages.
//!
//! A single edge-triggered flag raised by the capture side when the user
//! starts speaking. The LLM stage polls it between chunks, the TTS worker
//! discards finished synthesis while it is up, and the playback worker
//! polls it every ~10ms during playback and clears it after stopping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared barge-in flag.
///
/// Raised only by the capture stage on a confirmed speech onset; lowered
/// only by consumers (playback after stopping, the LLM stage when it begins
/// a fresh turn). Repeated raises while already raised are no-ops.
#[derive(Debug, Clone, Default)]
pub struct BargeIn {
    flag: Arc<AtomicBool>,
}

impl BargeIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` if this call performed the edge
    /// transition (the flag was previously down).
    pub fn raise(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Whether the flag is currently up.
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Lower the flag. Consumers only.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drain a queue without blocking, dropping every pending item.
///
/// The text and audio queues are MPMC precisely so the supervisor-side
/// barge-in handler can empty them here while the workers keep their own
/// receivers; doing the drain in one place closes the window where the TTS
/// worker could publish a stale artifact that playback then picks up.
pub fn drain_queue<T>(rx: &crossbeam_channel::Receiver<T>) -> usize {
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}
