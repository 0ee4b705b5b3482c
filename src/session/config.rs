use crate::audio::CaptureConfig;
use crate::stt::SttConfig;
use std::path::PathBuf;

/// Configuration for one transcription session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client-side session identifier (e.g. "room-<uuid>"); the remote
    /// assigns its own id on connect
    pub session_id: String,

    /// Streaming service connection parameters
    pub stt: SttConfig,

    /// HTTP endpoint that issues short-lived session tokens
    pub token_url: String,

    /// Microphone capture parameters
    pub capture: CaptureConfig,

    /// When set, keep a WAV copy of the session's captured audio here
    pub recording_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("room-{}", uuid::Uuid::new_v4()),
            stt: SttConfig::default(),
            token_url: "http://localhost:3000/api/token".to_string(),
            capture: CaptureConfig::default(),
            recording_dir: None,
        }
    }
}
