//! Dictation collaborator seam.
//!
//! Speech-to-text runs outside this crate (platform recognizer, host
//! process). A dictation service delivers a single finished utterance per
//! start; interim results are never surfaced.

use crate::error::Result;

/// Progress of one dictation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictationEvent {
    Started,
    /// A finished transcript.
    Result(String),
    Error(String),
    Ended,
}

/// Receives dictation progress. May be called from any thread.
pub type DictationSink = Box<dyn Fn(DictationEvent) + Send + Sync>;

pub trait DictationService: Send {
    /// Begin listening for one utterance in `locale`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognizer cannot start at all; failures after
    /// starting arrive as [`DictationEvent::Error`].
    fn start(&mut self, locale: &str, sink: DictationSink) -> Result<()>;

    /// Stop listening. Idempotent.
    fn stop(&mut self);
}

/// Tracks the dictation in flight so the primary action can toggle it.
///
/// Each start gets a new generation. Cancelling (on a mode switch) moves the
/// generation on, so anything the old recognizer still delivers is stale.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DictationState {
    listening: bool,
    generation: u64,
}

impl DictationState {
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether events stamped with `generation` still belong to this state.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// A new dictation is starting. Returns the generation to stamp its events with.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.listening = true;
        self.generation
    }

    /// Listening stopped on request; a trailing result is still accepted.
    pub fn finish(&mut self) {
        self.listening = false;
    }

    /// Abandon the current dictation; its later events are dropped.
    pub fn cancel(&mut self) {
        self.listening = false;
        self.generation += 1;
    }

    /// Apply an event stamped with `generation`. Returns the finished
    /// transcript, if it carried one. Stale events change nothing.
    pub fn apply(&mut self, generation: u64, event: &DictationEvent) -> Option<String> {
        if !self.is_current(generation) {
            return None;
        }
        match event {
            DictationEvent::Started => {
                self.listening = true;
                None
            }
            DictationEvent::Result(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_owned())
            }
            DictationEvent::Error(_) | DictationEvent::Ended => {
                self.listening = false;
                None
            }
        }
    }
}
