//! 16-bit PCM framing for the duplex channel.
//!
//! Outbound frames are signed 16-bit little-endian PCM; inbound model audio
//! arrives in the same format at a declared sample rate.

use crate::error::{AssistError, Result};

/// Scale used when quantizing outbound samples.
const ENCODE_SCALE: f32 = 32_767.0;
/// Scale used when converting inbound samples back to float.
const DECODE_SCALE: f32 = 32_768.0;

/// A decoded, playable block of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved f32 samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioBuffer {
    /// Create a buffer from interleaved samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Whether the buffer holds no audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Down-mix to mono by averaging channels.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels.max(1) as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// Encode normalized float samples as signed 16-bit little-endian PCM.
///
/// Out-of-range samples are clamped to `[-1, 1]`.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * ENCODE_SCALE).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode signed 16-bit little-endian PCM into a playable buffer.
///
/// # Errors
///
/// Returns [`AssistError::Decode`] if `channels` is zero or the byte length is
/// not a whole number of frames.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if channels == 0 {
        return Err(AssistError::Decode("channel count must be non-zero".into()));
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(AssistError::Decode(format!(
            "{} bytes is not a multiple of {frame_bytes} ({channels} channel 16-bit PCM)",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / DECODE_SCALE)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

/// Linear-interpolation resampler.
///
/// Speech-quality only; no anti-alias filter.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}
