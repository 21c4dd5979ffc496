//! Gapless playback on a single output clock.
//!
//! [`PlaybackScheduler`] places each decoded segment immediately after the
//! previous one on an [`OutputTimeline`], regardless of how bursty delivery
//! is. [`CpalTimeline`] is the device-backed timeline: a frame-counting mixer
//! running inside the cpal output callback.

use crate::audio::codec::{AudioBuffer, resample};
use crate::audio::device::{ReadySink, StreamThread};
use crate::config::AudioConfig;
use crate::error::{AssistError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identifies one scheduled segment on a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// A monotonic output clock that can play buffers at given times.
///
/// Implementations report natural completion of each scheduled source out of
/// band (the runtime feeds it back through [`PlaybackScheduler::source_ended`]).
/// A stopped source must not be reported.
pub trait OutputTimeline: Send {
    /// Current position of the output clock in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start at `start_at` seconds on this clock.
    ///
    /// # Errors
    ///
    /// Returns [`AssistError::DeviceUnavailable`] if the output device cannot be used.
    fn schedule(&mut self, id: SourceId, buffer: &AudioBuffer, start_at: f64) -> Result<()>;

    /// Stop a source immediately, whether pending or playing.
    fn stop(&mut self, id: SourceId);
}

/// One scheduled segment owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveSource {
    pub id: SourceId,
    /// Scheduled start on the output clock, in seconds.
    pub start_at: f64,
    /// Duration in seconds.
    pub duration: f64,
}

/// Sequential gapless scheduler with hard interruption.
pub struct PlaybackScheduler {
    timeline: Box<dyn OutputTimeline>,
    next_start_time: f64,
    live_sources: HashMap<SourceId, ActiveSource>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(timeline: Box<dyn OutputTimeline>) -> Self {
        let next_start_time = timeline.current_time();
        Self {
            timeline,
            next_start_time,
            live_sources: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedule `buffer` right after everything already queued, or now if the
    /// queue has run dry.
    ///
    /// # Errors
    ///
    /// Returns [`AssistError::DeviceUnavailable`] if the timeline rejects the
    /// buffer; scheduler state is left unchanged.
    pub fn enqueue(&mut self, buffer: &AudioBuffer) -> Result<SourceId> {
        let now = self.timeline.current_time();
        let start_at = self.next_start_time.max(now);
        let id = SourceId(self.next_id);
        self.timeline.schedule(id, buffer, start_at)?;

        self.next_id += 1;
        let duration = buffer.duration();
        self.next_start_time = start_at + duration;
        self.live_sources.insert(
            id,
            ActiveSource {
                id,
                start_at,
                duration,
            },
        );
        debug!(
            id = id.0,
            start_at,
            duration,
            live = self.live_sources.len(),
            "segment scheduled"
        );
        Ok(id)
    }

    /// Stop every live source and rewind the queue to the current clock.
    ///
    /// Idempotent.
    pub fn flush(&mut self) {
        let count = self.live_sources.len();
        for id in self.live_sources.keys() {
            self.timeline.stop(*id);
        }
        self.live_sources.clear();
        self.next_start_time = self.timeline.current_time();
        if count > 0 {
            debug!(count, "playback flushed");
        }
    }

    /// Record natural completion of a source.
    ///
    /// Returns `true` when this completion drained the queue. Completions for
    /// flushed or unknown sources are ignored.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        if self.live_sources.remove(&id).is_none() {
            return false;
        }
        let drained = self.live_sources.is_empty();
        if drained {
            debug!("playback drained");
        }
        drained
    }

    /// Whether any source is pending or playing.
    pub fn is_playing(&self) -> bool {
        !self.live_sources.is_empty()
    }

    /// Number of live sources.
    pub fn live_count(&self) -> usize {
        self.live_sources.len()
    }

    /// Where the next segment would start if enqueued now (before clamping to the clock).
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// The live sources in scheduled order.
    pub fn live_sources(&self) -> Vec<ActiveSource> {
        let mut sources: Vec<ActiveSource> = self.live_sources.values().copied().collect();
        sources.sort_by_key(|s| s.id);
        sources
    }
}

/// Frame-counting mixer shared with the output callback.
struct Mixer {
    sample_rate: u32,
    frame: u64,
    sources: Vec<MixSource>,
    ended: mpsc::UnboundedSender<SourceId>,
}

struct MixSource {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Mixer {
    fn new(sample_rate: u32, ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            sample_rate,
            frame: 0,
            sources: Vec::new(),
            ended,
        }
    }

    fn current_time(&self) -> f64 {
        self.frame as f64 / f64::from(self.sample_rate.max(1))
    }

    fn add(&mut self, id: SourceId, buffer: &AudioBuffer, start_at: f64) {
        let samples = resample(&buffer.to_mono(), buffer.sample_rate, self.sample_rate);
        let start_frame = (start_at * f64::from(self.sample_rate)).round().max(0.0) as u64;
        self.sources.push(MixSource {
            id,
            samples,
            start_frame,
        });
    }

    fn remove(&mut self, id: SourceId) {
        self.sources.retain(|s| s.id != id);
    }

    /// The device went away: report every pending source as finished.
    fn abandon(&mut self) {
        for source in self.sources.drain(..) {
            let _ = self.ended.send(source.id);
        }
    }

    /// Fill an interleaved output block and advance the clock.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mut frames = 0u64;
        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let t = self.frame + i as u64;
            let mut acc = 0.0f32;
            for source in &self.sources {
                if t >= source.start_frame
                    && let Some(s) = source.samples.get((t - source.start_frame) as usize)
                {
                    acc += *s;
                }
            }
            frame.fill(acc.clamp(-1.0, 1.0));
            frames += 1;
        }
        self.frame += frames;

        let now = self.frame;
        let ended = &self.ended;
        self.sources.retain(|source| {
            let done = now >= source.start_frame + source.samples.len() as u64;
            if done {
                let _ = ended.send(source.id);
            }
            !done
        });
    }
}

/// Output timeline backed by the system output device.
///
/// The device stream is opened on first use and held until drop. Opening does
/// not block: sources queue in the mixer and start once the device runs. If the
/// open fails, queued sources are reported ended and the next `schedule`
/// returns the error.
pub struct CpalTimeline {
    device_name: Option<String>,
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<StreamThread>,
    open_error: Arc<Mutex<Option<AssistError>>>,
}

impl CpalTimeline {
    /// Create a timeline that reports completed sources on `ended`.
    pub fn new(config: &AudioConfig, ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            device_name: config.output_device.clone(),
            mixer: Arc::new(Mutex::new(Mixer::new(config.output_sample_rate, ended))),
            stream: None,
            open_error: Arc::new(Mutex::new(None)),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AssistError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn ensure_open(&mut self) -> Result<()> {
        let failed = self.open_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(e) = failed {
            // Retry on the next call.
            self.stream = None;
            return Err(e);
        }
        if self.stream.is_some() {
            return Ok(());
        }
        let device_name = self.device_name.clone();
        let mixer = Arc::clone(&self.mixer);

        let on_ready: ReadySink = {
            let mixer = Arc::clone(&self.mixer);
            let open_error = Arc::clone(&self.open_error);
            Box::new(move |result| {
                let Err(e) = result else {
                    return;
                };
                warn!("output device failed to open: {e}");
                if let Ok(mut m) = mixer.lock() {
                    m.abandon();
                }
                if let Ok(mut slot) = open_error.lock() {
                    *slot = Some(e);
                }
            })
        };

        let build = move || {
            let host = cpal::default_host();
            let device = match device_name.as_deref() {
                Some(name) => host
                    .output_devices()
                    .map_err(|e| AssistError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
                    .find(|d| {
                        d.description()
                            .ok()
                            .map(|desc| desc.name() == name)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        AssistError::DeviceUnavailable(format!("output device '{name}' not found"))
                    })?,
                None => host
                    .default_output_device()
                    .ok_or_else(|| AssistError::DeviceUnavailable("no default output device".into()))?,
            };
            let default_config = device
                .default_output_config()
                .map_err(|e| AssistError::DeviceUnavailable(format!("no default output config: {e}")))?;

            let channels = default_config.channels();
            let sample_rate = default_config.sample_rate();
            let stream_config = StreamConfig {
                channels,
                sample_rate,
                buffer_size: cpal::BufferSize::Default,
            };
            if let Ok(mut m) = mixer.lock() {
                m.sample_rate = sample_rate;
                m.frame = 0;
            }
            info!("output config: {}Hz, {} channels", sample_rate, channels);

            let stream = device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        match mixer.lock() {
                            Ok(mut m) => m.render(data, channels as usize),
                            Err(_) => data.fill(0.0),
                        }
                    },
                    move |err| {
                        error!("audio output stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| AssistError::DeviceUnavailable(format!("failed to build output stream: {e}")))?;

            stream
                .play()
                .map_err(|e| AssistError::DeviceUnavailable(format!("failed to start output stream: {e}")))?;
            Ok(stream)
        };

        self.stream = Some(StreamThread::spawn("playback", build, on_ready)?);
        Ok(())
    }
}

impl OutputTimeline for CpalTimeline {
    fn current_time(&self) -> f64 {
        match self.mixer.lock() {
            Ok(m) => m.current_time(),
            Err(_) => 0.0,
        }
    }

    fn schedule(&mut self, id: SourceId, buffer: &AudioBuffer, start_at: f64) -> Result<()> {
        self.ensure_open()?;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|e| AssistError::DeviceUnavailable(format!("playback mixer poisoned: {e}")))?;
        mixer.add(id, buffer, start_at);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        match self.mixer.lock() {
            Ok(mut m) => m.remove(id),
            Err(e) => warn!("playback mixer poisoned: {e}"),
        }
    }
}
