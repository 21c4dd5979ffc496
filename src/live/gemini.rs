//! WebSocket duplex transport for the hosted model's live endpoint.
//!
//! One background task per channel owns the socket. It sends the setup
//! message, forwards queued audio frames as realtime input and decodes every
//! server message into [`InboundEvent`]s for the session.

use super::transport::{DuplexChannel, DuplexTransport, EventSink, InboundEvent, SessionRequest};
use crate::audio::capture::FrameSink;
use crate::service::AuthState;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens live sessions against the configured WebSocket endpoint.
pub struct GeminiLiveTransport {
    endpoint: String,
    auth: Arc<AuthState>,
}

impl GeminiLiveTransport {
    pub fn new(endpoint: impl Into<String>, auth: Arc<AuthState>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth,
        }
    }
}

impl DuplexTransport for GeminiLiveTransport {
    fn open(&mut self, request: SessionRequest, sink: EventSink) -> Box<dyn DuplexChannel> {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let cancel = CancellationToken::new();
        let channel = Box::new(GeminiLiveChannel {
            outbound: tx,
            cancel: cancel.clone(),
        });

        let url = match self
            .auth
            .credential()
            .and_then(|key| authorized_url(&self.endpoint, &key))
        {
            Ok(url) => url,
            Err(e) => {
                sink(InboundEvent::Error(e.to_string()));
                return channel;
            }
        };

        let setup = setup_message(&request);
        let input_rate = request.input_sample_rate;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Ok(Outcome::Cancelled),
                result = drive(url, setup, input_rate, rx, &sink) => result,
            };
            match outcome {
                Ok(Outcome::Cancelled) => debug!("live channel closed locally"),
                Ok(Outcome::Closed(reason)) => {
                    info!(?reason, "live channel closed by server");
                    sink(InboundEvent::Closed { reason });
                }
                Err(e) => {
                    warn!("live channel failed: {e}");
                    sink(InboundEvent::Error(e));
                }
            }
        });

        channel
    }
}

struct GeminiLiveChannel {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl DuplexChannel for GeminiLiveChannel {
    fn send_realtime_input(&self, frame: Vec<u8>) {
        let _ = self.outbound.send(frame);
    }

    fn frame_sink(&self) -> FrameSink {
        let tx = self.outbound.clone();
        Box::new(move |frame| {
            let _ = tx.send(frame);
        })
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Cancelled,
    Closed(Option<String>),
}

async fn drive(
    url: String,
    setup: String,
    input_rate: u32,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: &EventSink,
) -> std::result::Result<Outcome, String> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(setup))
        .await
        .map_err(|e| format!("send setup: {e}"))?;
    debug!("live setup sent");

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_server_message(&text) {
                            sink(event);
                        }
                    }
                    // The live endpoint delivers JSON in binary frames too.
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            for event in parse_server_message(text) {
                                sink(event);
                            }
                        }
                        Err(_) => debug!("ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => close_outcome(u16::from(frame.code), &frame.reason),
                            None => Ok(Outcome::Closed(None)),
                        };
                    }
                    None => return Ok(Outcome::Closed(None)),
                    Some(Err(e)) => return Err(format!("read error: {e}")),
                    _ => {}
                }
            }
            Some(frame) = outbound.recv() => {
                let msg = realtime_input_message(&frame, input_rate);
                if let Err(e) = write.send(Message::Text(msg)).await {
                    return Err(format!("send error: {e}"));
                }
            }
        }
    }
}

/// Map a close frame to a clean close or an error.
fn close_outcome(code: u16, reason: &str) -> std::result::Result<Outcome, String> {
    let reason = (!reason.is_empty()).then(|| reason.to_owned());
    if code == 1000 {
        Ok(Outcome::Closed(reason))
    } else {
        Err(format!(
            "closed with code {code}: {}",
            reason.as_deref().unwrap_or("no reason")
        ))
    }
}

fn authorized_url(endpoint: &str, key: &str) -> crate::error::Result<String> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| crate::error::AssistError::Config(format!("invalid live_url: {e}")))?;
    url.query_pairs_mut().append_pair("key", key);
    Ok(url.into())
}

/// The first message on a new socket.
pub fn setup_message(request: &SessionRequest) -> String {
    let model = if request.model.starts_with("models/") {
        request.model.clone()
    } else {
        format!("models/{}", request.model)
    };
    let mut setup = json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": request.voice }
                    }
                }
            },
            "systemInstruction": {
                "parts": [{ "text": request.system_instruction }]
            }
        }
    });
    if !request.tools.is_empty() {
        setup["setup"]["tools"] = json!([{ "functionDeclarations": request.tools }]);
    }
    setup.to_string()
}

/// One outbound audio frame as realtime input.
pub fn realtime_input_message(frame: &[u8], sample_rate: u32) -> String {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format!("audio/pcm;rate={sample_rate}"),
                "data": BASE64.encode(frame),
            }]
        }
    })
    .to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCall>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

/// Decode one server message into inbound events, in delivery order.
///
/// Unparseable messages and undecodable audio parts are dropped.
pub fn parse_server_message(text: &str) -> Vec<InboundEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring unparseable server message: {e}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(InboundEvent::Opened);
    }
    if let Some(content) = msg.server_content {
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|p| p.inline_data) {
            if !inline.mime_type.starts_with("audio/") {
                continue;
            }
            match BASE64.decode(inline.data.as_bytes()) {
                Ok(bytes) => events.push(InboundEvent::Audio(bytes)),
                Err(e) => warn!("dropping undecodable audio part: {e}"),
            }
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }
    if let Some(call) = msg.tool_call {
        for f in call.function_calls {
            events.push(InboundEvent::ToolInvocation {
                name: f.name,
                args: f.args,
            });
        }
    }
    if msg.go_away.is_some() {
        debug!("server announced session end");
    }
    events
}
