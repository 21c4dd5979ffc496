//! Microphone capture loop.
//!
//! The [`Microphone`] seam delivers fixed-size blocks of mono samples at the
//! configured input rate. [`CaptureLoop`] applies the mute gate, encodes each
//! block as 16-bit PCM and hands the frame to the caller's sink. A muted tick
//! produces nothing at all; silence is never substituted.
//!
//! Opening a device does not wait for it: the outcome is delivered to a
//! [`ReadySink`], which may run on another thread.

use crate::audio::codec::{self, resample};
use crate::audio::device::{ReadySink, StreamThread};
use crate::config::AudioConfig;
use crate::error::{AssistError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Receives one encoded frame per unmuted capture tick.
pub type FrameSink = Box<dyn FnMut(Vec<u8>) + Send>;

/// Receives one block of mono samples per capture tick.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send>;

/// An open device stream. Releasing it closes the device.
pub trait DeviceStream: Send {
    /// Close the device synchronously. Must be idempotent.
    fn release(&mut self);
}

/// Source of microphone blocks.
pub trait Microphone: Send {
    /// Begin acquiring the input device; once open, deliver
    /// `block_size`-sample blocks to `on_block`.
    ///
    /// `on_ready` receives [`AssistError::DeviceUnavailable`] when permission
    /// is denied or no input device exists.
    ///
    /// # Errors
    ///
    /// Returns an error only if the attempt cannot be started at all.
    fn open(
        &mut self,
        block_size: usize,
        on_block: BlockSink,
        on_ready: ReadySink,
    ) -> Result<Box<dyn DeviceStream>>;
}

/// Owns the acquired device for one session.
pub struct CaptureHandle {
    stream: Option<Box<dyn DeviceStream>>,
}

impl CaptureHandle {
    /// Whether the device is still held.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.release();
                true
            }
            None => false,
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Periodic capture with a mute gate.
pub struct CaptureLoop {
    microphone: Box<dyn Microphone>,
    block_size: usize,
    muted: Arc<AtomicBool>,
}

impl CaptureLoop {
    /// Create a capture loop over the given microphone.
    pub fn new(microphone: Box<dyn Microphone>, block_size: usize) -> Self {
        Self {
            microphone,
            block_size: block_size.max(1),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin acquiring the microphone and forward encoded frames to `on_frame`
    /// once it is open. `on_ready` learns whether the device opened.
    ///
    /// # Errors
    ///
    /// Returns [`AssistError::DeviceUnavailable`] if the attempt cannot start.
    pub fn start(&mut self, mut on_frame: FrameSink, on_ready: ReadySink) -> Result<CaptureHandle> {
        let muted = Arc::clone(&self.muted);
        let on_block: BlockSink = Box::new(move |block: &[f32]| {
            if muted.load(Ordering::Relaxed) {
                return;
            }
            on_frame(codec::encode(block));
        });

        let stream = self.microphone.open(self.block_size, on_block, on_ready)?;
        info!(block_size = self.block_size, "capture opening");
        Ok(CaptureHandle {
            stream: Some(stream),
        })
    }

    /// Release the device. Idempotent.
    pub fn stop(&mut self, handle: &mut CaptureHandle) {
        if handle.release() {
            info!("capture stopped");
        }
    }

    /// Gate outbound frames; applies from the next tick.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        debug!(muted, "capture mute changed");
    }

    /// Whether outbound frames are currently gated.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

/// Splits an arbitrary-length sample stream into fixed-size blocks.
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append samples and emit every completed block to `on_block`.
    pub fn push(&mut self, samples: &[f32], on_block: &mut dyn FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        let mut start = 0;
        while self.pending.len() - start >= self.block_size {
            on_block(&self.pending[start..start + self.block_size]);
            start += self.block_size;
        }
        self.pending.drain(..start);
    }
}

/// Microphone capture from the system input device via cpal.
///
/// Captures at the device's native rate, down-mixes to mono and resamples to
/// the configured input rate before assembling blocks.
pub struct CpalMicrophone {
    device_name: Option<String>,
    target_sample_rate: u32,
}

impl CpalMicrophone {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            target_sample_rate: config.input_sample_rate,
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AssistError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AssistError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| AssistError::DeviceUnavailable(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| AssistError::DeviceUnavailable("no default input device".into())),
    }
}

struct CpalInputStream {
    thread: StreamThread,
}

impl DeviceStream for CpalInputStream {
    fn release(&mut self) {
        self.thread.release();
    }
}

impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        block_size: usize,
        mut on_block: BlockSink,
        on_ready: ReadySink,
    ) -> Result<Box<dyn DeviceStream>> {
        let device_name = self.device_name.clone();
        let target_rate = self.target_sample_rate;

        let build = move || {
            let device = find_input_device(device_name.as_deref())?;
            let default_config = device
                .default_input_config()
                .map_err(|e| AssistError::DeviceUnavailable(format!("no default input config: {e}")))?;

            let native_rate = default_config.sample_rate();
            let native_channels = default_config.channels();
            let stream_config = StreamConfig {
                channels: native_channels,
                sample_rate: native_rate,
                buffer_size: cpal::BufferSize::Default,
            };
            info!(
                "native input config: {}Hz, {} channels -> {}Hz mono",
                native_rate, native_channels, target_rate
            );

            let mut assembler = BlockAssembler::new(block_size);
            let stream = device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        let mono = if native_channels > 1 {
                            let ch = native_channels as usize;
                            data.chunks_exact(ch)
                                .map(|frame| frame.iter().sum::<f32>() / ch as f32)
                                .collect()
                        } else {
                            data.to_vec()
                        };
                        let samples = resample(&mono, native_rate, target_rate);
                        assembler.push(&samples, &mut |block| on_block(block));
                    },
                    move |err| {
                        error!("audio input stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| AssistError::DeviceUnavailable(format!("failed to build input stream: {e}")))?;

            stream
                .play()
                .map_err(|e| AssistError::DeviceUnavailable(format!("failed to start input stream: {e}")))?;
            Ok(stream)
        };

        let thread = StreamThread::spawn("capture", build, on_ready)?;
        Ok(Box::new(CpalInputStream { thread }))
    }
}
