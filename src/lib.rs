pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod stt;
pub mod transcript;

pub use audio::{AudioCapture, AudioFrame, CaptureConfig, CaptureEvent, MicrophoneCapture};
pub use config::Config;
pub use error::{
    ConnectError, DeviceError, ProtocolError, SendError, SessionError, TokenError, TransportError,
};
pub use session::{
    SessionConfig, SessionController, SessionNotice, SessionSnapshot, SessionState, SessionStats,
};
pub use stt::{
    HttpTokenSource, IssuedToken, LinkSignal, LinkState, SttConfig, TokenSource, TranscriptEvent,
    TranscriptionLink,
};
pub use transcript::{TranscriptReconciler, TranscriptState};
