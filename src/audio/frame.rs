/// Configuration for microphone capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target sample rate (the streaming service expects 16kHz)
    pub sample_rate: u32,
    /// Target channel count (1 = mono)
    pub channels: u16,
    /// Duration of each emitted frame in milliseconds
    pub frame_duration_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 100,
        }
    }
}

impl CaptureConfig {
    /// Number of samples in one emitted frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms / 1000) as usize
            * self.channels as usize
    }
}

/// One fixed-duration slice of captured audio (mono, 16-bit PCM).
///
/// `sequence` increases monotonically per capture stream and exists for
/// diagnostics only; ordering is guaranteed by the channel the frames
/// travel on, not by this index.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub sequence: u64,
}

impl AudioFrame {
    /// Little-endian byte view of the samples, as sent on the wire.
    pub fn pcm_bytes(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// Slices an arbitrary sample flow into exact fixed-duration frames.
///
/// The cpal callback delivers buffers of whatever size the OS chooses;
/// this accumulates them and emits complete frames only.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Vec<i16>,
    frame_len: usize,
    sample_rate: u32,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            pending: Vec::with_capacity(config.samples_per_frame() * 2),
            frame_len: config.samples_per_frame(),
            sample_rate: config.sample_rate,
            next_sequence: 0,
        }
    }

    /// Append samples and drain all complete frames.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.next_sequence,
            });
            self.next_sequence += 1;
        }
        frames
    }
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Downsample by decimation (every Nth sample). Only integer ratios are
/// supported; the capture layer rejects devices with non-integer ratios.
pub fn decimate(samples: &[i16], factor: u32) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples.iter().step_by(factor as usize).copied().collect()
}

/// Convert f32 samples (cpal's common native format) to i16 PCM.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}
