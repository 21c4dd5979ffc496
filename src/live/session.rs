//! Live duplex session life cycle.
//!
//! `Idle -> Connecting -> Active -> Closing -> Idle`, with `Errored` as a
//! per-attempt detour back to `Idle`. The session is driven entirely by the
//! runtime's event queue: transport callbacks and microphone readiness are
//! posted as [`SessionEvent`]s tagged with the generation that opened them, so
//! events from a torn-down channel are recognised and dropped.
//!
//! Methods return [`SessionEffect`]s instead of touching the orb or the mode
//! directly; the runtime applies them in order.

use super::transport::{
    DuplexChannel, DuplexTransport, EventSink, InboundEvent, SessionRequest, requested_mode,
};
use crate::audio::capture::{CaptureHandle, CaptureLoop};
use crate::audio::codec;
use crate::audio::device::ReadySink;
use crate::audio::playback::PlaybackScheduler;
use crate::error::AssistError;
use crate::mode::{Mode, OrbState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Errored,
}

/// What a [`SessionEvent`] carries.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// Something arrived on the channel.
    Inbound(InboundEvent),
    /// The microphone finished opening (or failed to).
    CaptureReady(Result<(), AssistError>),
}

/// A signal stamped with the session generation that produced it.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub generation: u64,
    pub signal: SessionSignal,
}

/// Something the runtime must do on the session's behalf.
#[derive(Debug, Clone)]
pub enum SessionEffect {
    Orb(OrbState),
    /// Teardown has completed; switch to this mode.
    SwitchMode(Mode),
    /// The session ended with this error.
    Error(AssistError),
}

pub struct LiveSession {
    transport: Box<dyn DuplexTransport>,
    capture: CaptureLoop,
    request: SessionRequest,
    output_sample_rate: u32,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    generation: u64,
    channel: Option<Box<dyn DuplexChannel>>,
    capture_handle: Option<CaptureHandle>,
}

impl LiveSession {
    pub fn new(
        transport: Box<dyn DuplexTransport>,
        capture: CaptureLoop,
        request: SessionRequest,
        output_sample_rate: u32,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            capture,
            request,
            output_sample_rate,
            events,
            state: SessionState::Idle,
            generation: 0,
            channel: None,
            capture_handle: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the current (or most recent) channel.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a channel is opening or open.
    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Connecting | SessionState::Active)
    }

    /// Whether the microphone is currently held.
    pub fn holds_capture(&self) -> bool {
        self.capture_handle.is_some()
    }

    /// Begin opening a channel. A no-op unless idle.
    pub fn start(&mut self) -> Vec<SessionEffect> {
        if self.state != SessionState::Idle {
            debug!(state = ?self.state, "live start ignored");
            return Vec::new();
        }

        self.generation += 1;
        self.state = SessionState::Connecting;
        info!(generation = self.generation, "live session connecting");

        let tx = self.events.clone();
        let generation = self.generation;
        let sink: EventSink = Box::new(move |event| {
            let _ = tx.send(SessionEvent {
                generation,
                signal: SessionSignal::Inbound(event),
            });
        });
        self.channel = Some(self.transport.open(self.request.clone(), sink));

        vec![SessionEffect::Orb(OrbState::Thinking)]
    }

    /// Apply one inbound event.
    pub fn handle(
        &mut self,
        event: SessionEvent,
        playback: &mut PlaybackScheduler,
    ) -> Vec<SessionEffect> {
        if event.generation != self.generation || !self.is_running() {
            debug!(
                event_generation = event.generation,
                generation = self.generation,
                "dropping stale live event"
            );
            return Vec::new();
        }

        let event = match event.signal {
            SessionSignal::CaptureReady(result) => return self.on_capture_ready(result, playback),
            SessionSignal::Inbound(event) => event,
        };
        match event {
            InboundEvent::Opened => self.on_opened(playback),
            InboundEvent::Closed { reason } => {
                info!(?reason, "live channel closed");
                self.stop(playback)
            }
            InboundEvent::Error(text) => self.fail(AssistError::from_text(text), playback),
            _ if self.state != SessionState::Active => {
                debug!("ignoring live event before open");
                Vec::new()
            }
            InboundEvent::Audio(bytes) => self.on_audio(&bytes, playback),
            InboundEvent::Interrupted => {
                playback.flush();
                debug!("model interrupted");
                vec![SessionEffect::Orb(OrbState::Listening)]
            }
            InboundEvent::TurnComplete => Vec::new(),
            InboundEvent::ToolInvocation { name, args } => match requested_mode(&name, &args) {
                Some(mode) => {
                    info!(%mode, "model requested mode switch");
                    let mut effects = self.stop(playback);
                    effects.push(SessionEffect::SwitchMode(mode));
                    effects
                }
                None => {
                    warn!(tool = %name, %args, "ignoring unsupported tool call");
                    Vec::new()
                }
            },
        }
    }

    /// The playback queue ran dry.
    pub fn playback_drained(&self) -> Vec<SessionEffect> {
        if self.state == SessionState::Active {
            vec![SessionEffect::Orb(OrbState::Listening)]
        } else {
            Vec::new()
        }
    }

    /// Tear everything down and return to idle. Idempotent.
    ///
    /// Releases the microphone and flushes playback before closing the channel;
    /// the close itself is fire-and-forget.
    pub fn stop(&mut self, playback: &mut PlaybackScheduler) -> Vec<SessionEffect> {
        if self.state == SessionState::Idle {
            return Vec::new();
        }
        self.state = SessionState::Closing;
        self.teardown(playback);
        self.state = SessionState::Idle;
        info!(generation = self.generation, "live session stopped");
        vec![SessionEffect::Orb(OrbState::Idle)]
    }

    /// Gate outbound frames. Applies from the next capture tick.
    pub fn set_muted(&self, muted: bool) {
        self.capture.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.capture.is_muted()
    }

    /// The channel is up; start acquiring the microphone. The session stays
    /// `Connecting` until the device reports in.
    fn on_opened(&mut self, playback: &mut PlaybackScheduler) -> Vec<SessionEffect> {
        if self.state != SessionState::Connecting || self.capture_handle.is_some() {
            return Vec::new();
        }
        let Some(channel) = self.channel.as_ref() else {
            return Vec::new();
        };
        let tx = self.events.clone();
        let generation = self.generation;
        let on_ready: ReadySink = Box::new(move |result| {
            let _ = tx.send(SessionEvent {
                generation,
                signal: SessionSignal::CaptureReady(result),
            });
        });
        match self.capture.start(channel.frame_sink(), on_ready) {
            Ok(handle) => {
                self.capture_handle = Some(handle);
                debug!(generation, "channel open; waiting for the microphone");
                Vec::new()
            }
            Err(e) => self.fail(e, playback),
        }
    }

    fn on_capture_ready(
        &mut self,
        result: Result<(), AssistError>,
        playback: &mut PlaybackScheduler,
    ) -> Vec<SessionEffect> {
        if self.state != SessionState::Connecting || self.capture_handle.is_none() {
            return Vec::new();
        }
        match result {
            Ok(()) => {
                self.state = SessionState::Active;
                info!(generation = self.generation, "live session active");
                vec![SessionEffect::Orb(OrbState::Connected)]
            }
            Err(e) => self.fail(e, playback),
        }
    }

    fn on_audio(&mut self, bytes: &[u8], playback: &mut PlaybackScheduler) -> Vec<SessionEffect> {
        let buffer = match codec::decode(bytes, self.output_sample_rate, 1) {
            Ok(b) => b,
            Err(e) => {
                warn!("dropping audio chunk: {e}");
                return Vec::new();
            }
        };
        let was_playing = playback.is_playing();
        match playback.enqueue(&buffer) {
            Ok(_) if !was_playing => vec![SessionEffect::Orb(OrbState::Speaking)],
            Ok(_) => Vec::new(),
            Err(e) => self.fail(e, playback),
        }
    }

    fn fail(&mut self, error: AssistError, playback: &mut PlaybackScheduler) -> Vec<SessionEffect> {
        warn!(kind = %error.kind(), "live session failed: {error}");
        self.state = SessionState::Errored;
        self.teardown(playback);
        self.state = SessionState::Idle;
        vec![SessionEffect::Error(error)]
    }

    fn teardown(&mut self, playback: &mut PlaybackScheduler) {
        if let Some(mut handle) = self.capture_handle.take() {
            self.capture.stop(&mut handle);
        }
        playback.flush();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        // Anything the old channel still delivers is now stale.
        self.generation += 1;
    }
}
