//! Audio framing, capture and playback via cpal.

pub mod capture;
pub mod codec;
pub mod device;
pub mod playback;

pub use capture::{CaptureHandle, CaptureLoop, CpalMicrophone, FrameSink, Microphone};
pub use codec::AudioBuffer;
pub use device::ReadySink;
pub use playback::{CpalTimeline, OutputTimeline, PlaybackScheduler, SourceId};
