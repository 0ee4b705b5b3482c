use super::controller::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Statistics about a transcription session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,

    /// When the session was started (None before the first start)
    pub started_at: Option<DateTime<Utc>>,

    /// Seconds since start
    pub duration_secs: f64,

    /// Audio frames actually sent on the link (pre-Active frames are
    /// dropped and not counted)
    pub frames_sent: usize,

    /// Inbound transcript events processed
    pub events_received: usize,

    /// Finalized utterances so far
    pub finalized_count: usize,
}
