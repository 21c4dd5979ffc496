//! Tradie: a voice-first assistant front-end for tradespeople.
//!
//! Relays typed text, dictation, attachments and live duplex audio to a
//! hosted generative model, and renders streamed replies, synthesized speech
//! and generated images.
//!
//! # Architecture
//!
//! Everything runs on one event queue ([`runtime::App`]):
//! - **Audio**: 16-bit PCM framing, microphone capture with a mute gate,
//!   gapless playback on a single output clock (`cpal`)
//! - **Live**: the duplex session state machine over a WebSocket transport
//! - **Modes**: Chat, Live and ImageGen share one status orb and one
//!   primary action, arbitrated by [`mode::ModeOrchestrator`]
//! - **Voice commands**: finished transcripts are checked for command
//!   phrases before they are used as input
//! - **Service**: request/response calls (completion, streaming, speech,
//!   images) over `reqwest`

pub mod audio;
pub mod chat;
pub mod config;
pub mod dictation;
pub mod error;
pub mod live;
pub mod mode;
pub mod runtime;
pub mod service;
pub mod voice_command;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::AssistConfig;
pub use error::{AssistError, ErrorKind, Result};
pub use mode::{Mode, OrbState};
pub use runtime::{App, AppCommand, AppHandle, AppUpdate, Collaborators};
