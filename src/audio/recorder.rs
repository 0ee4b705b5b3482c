use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::frame::{AudioFrame, CaptureConfig};

/// Writes a session's captured audio to a single WAV file.
///
/// Purely a local keepsake of the session; transcription streams the same
/// frames independently. Finalized on `finish()` and on drop.
pub struct SessionRecorder {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    path: PathBuf,
    samples_written: usize,
    sample_rate: u32,
}

impl SessionRecorder {
    pub fn create(
        output_dir: impl AsRef<Path>,
        session_id: &str,
        config: &CaptureConfig,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).context("Failed to create recording directory")?;

        let path = output_dir.join(format!("{session_id}.wav"));

        let spec = hound::WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create WAV file: {path:?}"))?;

        info!("Recording session audio to {}", path.display());

        Ok(Self {
            writer: Some(writer),
            path,
            samples_written: 0,
            sample_rate: config.sample_rate,
        })
    }

    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            self.samples_written += frame.samples.len();
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
            info!(
                "Session recording complete: {} ({:.1}s)",
                self.path.display(),
                self.samples_written as f64 / self.sample_rate as f64
            );
        }
        Ok(self.path.clone())
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}
