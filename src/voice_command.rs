//! Voice command detection for finished dictation transcripts.
//!
//! Checked before a transcript is used as input, so users can switch modes
//! or open the file picker hands-free. Matching is on the lowercased
//! transcript against an ordered phrase table; the first match wins.
//!
//! # Supported Commands
//!
//! | Phrase Pattern | Command |
//! |----------------|---------|
//! | "switch to chat", "chat mode" | `SwitchMode(Chat)` |
//! | "switch to live", "go live" | `SwitchMode(Live)` |
//! | "switch to visualizer", "image mode" | `SwitchMode(ImageGen)` |
//! | "open file picker", "attach a file" | `OpenFilePicker` |

use crate::mode::Mode;
use tracing::debug;

/// A command recognised in user speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    /// Switch to another interaction mode.
    SwitchMode(Mode),
    /// Ask the host to show its file picker.
    OpenFilePicker,
}

/// Outcome of routing a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// A command matched and was performed; the transcript is consumed.
    Handled(VoiceCommand),
    /// No command matched; the original transcript, untouched.
    Unhandled(String),
}

const PHRASES: &[(&str, VoiceCommand)] = &[
    ("open file picker", VoiceCommand::OpenFilePicker),
    ("open the file picker", VoiceCommand::OpenFilePicker),
    ("attach a file", VoiceCommand::OpenFilePicker),
    ("attach file", VoiceCommand::OpenFilePicker),
    ("upload a file", VoiceCommand::OpenFilePicker),
    ("switch to chat", VoiceCommand::SwitchMode(Mode::Chat)),
    ("switch to text", VoiceCommand::SwitchMode(Mode::Chat)),
    ("go to chat", VoiceCommand::SwitchMode(Mode::Chat)),
    ("chat mode", VoiceCommand::SwitchMode(Mode::Chat)),
    ("switch to live", VoiceCommand::SwitchMode(Mode::Live)),
    ("switch to voice", VoiceCommand::SwitchMode(Mode::Live)),
    ("go live", VoiceCommand::SwitchMode(Mode::Live)),
    ("live mode", VoiceCommand::SwitchMode(Mode::Live)),
    ("switch to visualizer", VoiceCommand::SwitchMode(Mode::ImageGen)),
    ("switch to visualiser", VoiceCommand::SwitchMode(Mode::ImageGen)),
    ("switch to image", VoiceCommand::SwitchMode(Mode::ImageGen)),
    ("visualizer mode", VoiceCommand::SwitchMode(Mode::ImageGen)),
    ("image mode", VoiceCommand::SwitchMode(Mode::ImageGen)),
];

/// Find the first command phrase in `transcript`.
pub fn detect(transcript: &str) -> Option<VoiceCommand> {
    let lower = transcript.to_lowercase();
    PHRASES
        .iter()
        .find(|(phrase, _)| lower.contains(phrase))
        .map(|(_, command)| *command)
}

/// Perform the command in `transcript`, if any.
///
/// On a match `perform` runs once and the transcript is consumed; otherwise
/// it is handed back verbatim.
pub fn route(transcript: String, perform: &mut dyn FnMut(VoiceCommand)) -> Routed {
    match detect(&transcript) {
        Some(command) => {
            debug!(?command, "voice command");
            perform(command);
            Routed::Handled(command)
        }
        None => Routed::Unhandled(transcript),
    }
}
