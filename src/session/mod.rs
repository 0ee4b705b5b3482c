//! Transcription session management
//!
//! `SessionController` ties the pieces together:
//! - microphone capture (fixed-duration PCM frames)
//! - token acquisition and the streaming transcription link
//! - transcript reconciliation (finalized lines + one revisable partial)
//! - lifecycle, cancellation, and failure teardown

mod config;
mod controller;
mod stats;

pub use config::SessionConfig;
pub use controller::{SessionController, SessionNotice, SessionSnapshot, SessionState};
pub use stats::SessionStats;
