pub mod capture;
pub mod frame;
pub mod recorder;

pub use capture::{AudioCapture, CaptureEvent, MicrophoneCapture};
pub use frame::{AudioFrame, CaptureConfig, FrameAssembler};
pub use recorder::SessionRecorder;
