//! Duplex channel seam.
//!
//! Inbound server traffic is decoded once at the transport boundary into the
//! closed [`InboundEvent`] variant; nothing downstream inspects raw payloads.

use crate::audio::capture::FrameSink;
use crate::mode::Mode;
use serde::Serialize;
use serde_json::{Value, json};

/// Name of the one tool the live model may call.
pub const SWITCH_MODE_TOOL: &str = "switch_mode";

/// An inbound event from the duplex channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The channel is open and accepting realtime input.
    Opened,
    /// A chunk of model speech: 16-bit PCM at the output sample rate.
    Audio(Vec<u8>),
    /// The model invoked a declared tool.
    ToolInvocation { name: String, args: Value },
    /// The user spoke over the model; pending speech must be discarded.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The channel closed without error.
    Closed { reason: Option<String> },
    /// The channel failed; the text is classified by the session.
    Error(String),
}

/// Parameters for opening a duplex session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Sample rate of outbound frames.
    pub input_sample_rate: u32,
    pub tools: Vec<ToolDeclaration>,
}

/// A function the model may call, in the service's declaration schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Declaration for the mode-switch tool.
pub fn switch_mode_tool() -> ToolDeclaration {
    ToolDeclaration {
        name: SWITCH_MODE_TOOL.to_owned(),
        description: "Switch the assistant out of live voice mode. Use `chat` when the user \
                      wants to type or read answers, `image` when they want a picture generated."
            .to_owned(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "mode": {
                    "type": "STRING",
                    "enum": ["chat", "image"],
                    "description": "Target mode."
                }
            },
            "required": ["mode"]
        }),
    }
}

/// Resolve a tool invocation to the mode it requests.
///
/// Returns `None` for other tools, an unrecognised `mode` argument, or a
/// request to stay in live mode.
pub fn requested_mode(name: &str, args: &Value) -> Option<Mode> {
    if name != SWITCH_MODE_TOOL {
        return None;
    }
    args.get("mode")
        .and_then(Value::as_str)
        .and_then(Mode::from_alias)
        .filter(|mode| *mode != Mode::Live)
}

/// Receives decoded inbound events. Called from the transport's I/O task.
pub type EventSink = Box<dyn Fn(InboundEvent) + Send + Sync>;

/// Opens duplex channels to the model.
pub trait DuplexTransport: Send {
    /// Begin opening a channel. Progress and failure arrive on `sink`
    /// (`Opened` first on success); the call itself never blocks on the network.
    fn open(&mut self, request: SessionRequest, sink: EventSink) -> Box<dyn DuplexChannel>;
}

/// An open (or opening) duplex channel.
pub trait DuplexChannel: Send {
    /// Queue one outbound audio frame. Fire-and-forget.
    fn send_realtime_input(&self, frame: Vec<u8>);

    /// A sink the capture thread can feed frames into directly.
    fn frame_sink(&self) -> FrameSink;

    /// Close the channel without waiting for the remote side. Idempotent.
    fn close(&mut self);
}
