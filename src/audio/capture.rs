use super::frame::{
    decimate, downmix_to_mono, f32_to_i16, AudioFrame, CaptureConfig, FrameAssembler,
};
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Emitted by a capture stream. Device loss mid-capture arrives in-band as
/// `Error`, after which the stream ends.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    Error(DeviceError),
}

/// Bounded frame queue between the audio callback and the session loop.
/// Overflow drops frames rather than buffering stale audio.
const FRAME_QUEUE: usize = 32;

/// Audio capture seam.
///
/// `open()` acquires the device and yields a lazy, non-restartable stream
/// of fixed-duration frames; `close()` releases the device and is
/// idempotent.
#[async_trait::async_trait]
pub trait AudioCapture: Send + Sync {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError>;

    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Capture source name for logging
    fn name(&self) -> &str;
}

/// cpal-backed microphone capture.
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread owns it for the
/// lifetime of the capture; the audio callback downmixes to mono, decimates
/// to the target rate and pushes complete frames through a bounded channel.
pub struct MicrophoneCapture {
    config: CaptureConfig,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            worker: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioCapture for MicrophoneCapture {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError> {
        if self.is_open() {
            return Err(DeviceError::Backend(
                "capture stream is already open".to_string(),
            ));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);

        let config = self.config.clone();
        let worker = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || capture_thread(config, frame_tx, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Backend(format!("failed to spawn capture thread: {e}")))?;

        // The thread reports the outcome of device acquisition; on failure
        // it exits without leaving an open stream behind.
        match ready_rx.await {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.worker = Some(worker);
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(DeviceError::Backend(
                    "capture thread exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            // Joining parks a thread; keep it off the async runtime.
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
            info!("Microphone capture released");
        }
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    fn name(&self) -> &str {
        "microphone (cpal)"
    }
}

/// Owns the cpal stream until `close()` signals or the capture handle is
/// dropped.
fn capture_thread(
    config: CaptureConfig,
    frame_tx: mpsc::Sender<CaptureEvent>,
    ready_tx: oneshot::Sender<Result<(), DeviceError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let stream = match build_stream(&config, frame_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(map_play_error(e)));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Parked until close(); the stream keeps delivering via its callbacks.
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Capture thread exiting");
}

struct CallbackState {
    assembler: FrameAssembler,
    tx: mpsc::Sender<CaptureEvent>,
    device_channels: u16,
    decimation: u32,
}

impl CallbackState {
    fn push(&mut self, samples: &[i16]) {
        let mono = downmix_to_mono(samples, self.device_channels);
        let resampled = decimate(&mono, self.decimation);

        for frame in self.assembler.push(&resampled) {
            match self.tx.try_send(CaptureEvent::Frame(frame)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Frame queue full, dropping audio frame");
                }
                // Receiver gone: session is tearing down
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

fn build_stream(
    config: &CaptureConfig,
    tx: mpsc::Sender<CaptureEvent>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NotFound)?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    // Prefer a native config matching the target format exactly
    let preferred = device.supported_input_configs().ok().and_then(|mut configs| {
        configs
            .find(|c| {
                c.channels() == config.channels
                    && c.sample_format() == SampleFormat::I16
                    && c.min_sample_rate().0 <= config.sample_rate
                    && config.sample_rate <= c.max_sample_rate().0
            })
            .map(|c| c.with_sample_rate(SampleRate(config.sample_rate)))
    });

    let supported = match preferred {
        Some(c) => c,
        None => device
            .default_input_config()
            .map_err(map_default_config_error)?,
    };

    let device_rate = supported.sample_rate().0;
    let device_channels = supported.channels();
    let sample_format = supported.sample_format();

    if device_rate < config.sample_rate || device_rate % config.sample_rate != 0 {
        // Decimation needs an integer ratio; anything else would shift pitch
        return Err(DeviceError::Backend(format!(
            "device sample rate {device_rate}Hz is not a multiple of {}Hz",
            config.sample_rate
        )));
    }

    info!(
        "Opening input device '{}': {}Hz {}ch {:?} -> {}Hz mono",
        device_name, device_rate, device_channels, sample_format, config.sample_rate
    );

    let mut state = CallbackState {
        assembler: FrameAssembler::new(config),
        tx: tx.clone(),
        device_channels,
        decimation: device_rate / config.sample_rate,
    };

    let error_callback = move |e: cpal::StreamError| {
        let _ = tx.try_send(CaptureEvent::Error(map_stream_error(e)));
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &supported.config(),
            move |data: &[i16], _: &cpal::InputCallbackInfo| state.push(data),
            error_callback,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &supported.config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| state.push(&f32_to_i16(data)),
            error_callback,
            None,
        ),
        other => {
            return Err(DeviceError::Backend(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };

    stream.map_err(map_build_error)
}

fn permission_or_backend(description: String) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        DeviceError::PermissionDenied
    } else {
        DeviceError::Backend(description)
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::Disconnected,
        cpal::BuildStreamError::BackendSpecific { err } => permission_or_backend(err.description),
        other => DeviceError::Backend(other.to_string()),
    }
}

fn map_default_config_error(e: cpal::DefaultStreamConfigError) -> DeviceError {
    match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceError::Disconnected,
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            permission_or_backend(err.description)
        }
        other => DeviceError::Backend(other.to_string()),
    }
}

fn map_play_error(e: cpal::PlayStreamError) -> DeviceError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceError::Disconnected,
        cpal::PlayStreamError::BackendSpecific { err } => permission_or_backend(err.description),
    }
}

fn map_stream_error(e: cpal::StreamError) -> DeviceError {
    match e {
        cpal::StreamError::DeviceNotAvailable => DeviceError::Disconnected,
        cpal::StreamError::BackendSpecific { err } => DeviceError::Backend(err.description),
    }
}
