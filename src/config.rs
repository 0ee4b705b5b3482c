use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub stt: SttSettings,
    pub audio: AudioSettings,
    pub recording: RecordingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SttSettings {
    /// WebSocket endpoint of the streaming transcription service
    pub endpoint: String,
    /// HTTP endpoint that issues short-lived session tokens
    pub token_url: String,
    /// Ask the service to punctuate/format finalized turns
    pub format_turns: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSettings {
    /// Keep a WAV copy of each session's captured audio
    pub enabled: bool,
    pub output_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "room-scribe".to_string(),
            },
            stt: SttSettings {
                endpoint: "wss://streaming.assemblyai.com/v3/ws".to_string(),
                token_url: "http://localhost:3000/api/token".to_string(),
                format_turns: true,
            },
            audio: AudioSettings {
                sample_rate: 16000, // the streaming service expects 16kHz
                channels: 1,        // mono
                frame_duration_ms: 100,
            },
            recording: RecordingSettings {
                enabled: false,
                output_dir: "recordings".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            // ROOM_SCRIBE__STT__TOKEN_URL=... overrides stt.token_url
            .add_source(config::Environment::with_prefix("ROOM_SCRIBE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
