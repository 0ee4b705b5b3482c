//! Streaming speech-to-text client: wire protocol, the WebSocket link, and
//! the session-token source.

pub mod link;
pub mod protocol;
pub mod token;

pub use link::{LinkSignal, LinkState, TranscriptionLink};
pub use protocol::TranscriptEvent;
pub use token::{HttpTokenSource, IssuedToken, TokenSource};

/// Connection parameters for the streaming service.
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// WebSocket endpoint (`wss://...`)
    pub endpoint: String,
    /// Sample rate of the PCM frames we send
    pub sample_rate: u32,
    /// Ask the service to punctuate/format finalized turns
    pub format_turns: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://streaming.assemblyai.com/v3/ws".to_string(),
            sample_rate: 16000,
            format_turns: true,
        }
    }
}
