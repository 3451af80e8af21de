//! Audio device I/O: microphone capture and artifact playback.

pub mod capture;
pub mod playback;
