//! Mode arbitration and the shared orb state.
//!
//! [`ModeOrchestrator`] is the only writer of the orb and the only holder of
//! the primary action. Mode components report into it; none of them touch the
//! orb directly.

use crate::error::AssistError;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// The three mutually exclusive interaction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Chat,
    Live,
    ImageGen,
}

impl Mode {
    /// Parse a mode name or one of its spoken aliases.
    pub fn from_alias(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "chat" | "text" => Some(Self::Chat),
            "live" | "voice" => Some(Self::Live),
            "image" | "imagegen" | "image_gen" | "visualizer" | "visualiser" => Some(Self::ImageGen),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Chat => "chat",
            Self::Live => "live",
            Self::ImageGen => "image",
        })
    }
}

/// The single shared status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrbState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Connected,
    Error,
}

impl fmt::Display for OrbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

/// What the primary trigger does right now.
pub type ActionHandle = Box<dyn FnMut() + Send>;

fn no_op() -> ActionHandle {
    Box::new(|| {})
}

pub struct ModeOrchestrator {
    mode: Mode,
    orb: OrbState,
    action: ActionHandle,
    status: Option<String>,
    error_deadline: Option<Instant>,
    error_clear_after: Duration,
}

impl ModeOrchestrator {
    pub fn new(initial: Mode, error_clear_after: Duration) -> Self {
        Self {
            mode: initial,
            orb: OrbState::Idle,
            action: no_op(),
            status: None,
            error_deadline: None,
            error_clear_after,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn orb(&self) -> OrbState {
        self.orb
    }

    /// User-facing message for the error currently shown, if any.
    pub fn status_message(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// When the error currently shown clears itself.
    pub fn error_deadline(&self) -> Option<Instant> {
        self.error_deadline
    }

    /// Make `target` the active mode.
    ///
    /// The previous mode's action is replaced with a no-op before anything
    /// else changes, so a trigger between here and the new mode's
    /// [`install_action`](Self::install_action) does nothing. Returns `false`
    /// if `target` is already active.
    pub fn switch_mode(&mut self, target: Mode) -> bool {
        if target == self.mode {
            return false;
        }
        self.action = no_op();
        self.orb = OrbState::Idle;
        self.clear_error();
        info!(from = %self.mode, to = %target, "mode switched");
        self.mode = target;
        true
    }

    /// Register the primary action for `mode`. Ignored unless `mode` is active.
    pub fn install_action(&mut self, mode: Mode, handle: ActionHandle) -> bool {
        if mode != self.mode {
            debug!(%mode, active = %self.mode, "ignoring action from inactive mode");
            return false;
        }
        self.action = handle;
        true
    }

    /// Fire the primary trigger.
    ///
    /// While an error is shown the trigger dismisses it instead. Returns
    /// `true` if the installed action ran.
    pub fn invoke_action(&mut self) -> bool {
        if self.orb == OrbState::Error {
            self.dismiss_error();
            return false;
        }
        (self.action)();
        true
    }

    /// Orb update from a mode component.
    ///
    /// Ignored for inactive modes and while an error is shown. Returns `true`
    /// if the orb changed.
    pub fn report_status(&mut self, mode: Mode, orb: OrbState) -> bool {
        if mode != self.mode || self.orb == OrbState::Error || self.orb == orb {
            return false;
        }
        debug!(%mode, from = %self.orb, to = %orb, "orb");
        self.orb = orb;
        true
    }

    /// Show `error` on the orb until dismissed or until it times out.
    pub fn report_error(&mut self, error: &AssistError, now: Instant) {
        info!(kind = %error.kind(), "showing error: {error}");
        self.orb = OrbState::Error;
        self.status = Some(error.user_message().to_owned());
        self.error_deadline = Some(now + self.error_clear_after);
    }

    /// Clear the error if its timeout has passed. Returns `true` if it cleared.
    pub fn expire_error(&mut self, now: Instant) -> bool {
        match self.error_deadline {
            Some(deadline) if now >= deadline => {
                debug!("error timed out");
                self.dismiss_error();
                true
            }
            _ => false,
        }
    }

    /// Clear a shown error back to idle.
    pub fn dismiss_error(&mut self) {
        if self.orb == OrbState::Error {
            self.orb = OrbState::Idle;
        }
        self.clear_error();
    }

    fn clear_error(&mut self) {
        self.status = None;
        self.error_deadline = None;
    }
}
