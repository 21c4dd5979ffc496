//! The live transport against a local WebSocket server.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tradie::live::transport::{EventSink, switch_mode_tool};
use tradie::live::{DuplexTransport, GeminiLiveTransport, InboundEvent, SessionRequest};
use tradie::service::AuthState;

fn request() -> SessionRequest {
    SessionRequest {
        model: "live-model".into(),
        voice: "Kore".into(),
        system_instruction: "Be brief.".into(),
        input_sample_rate: 16_000,
        tools: vec![switch_mode_tool()],
    }
}

fn collector() -> (EventSink, mpsc::UnboundedReceiver<InboundEvent>) {
    let (tx, rx) = mpsc::unbounded_channel::<InboundEvent>();
    let sink: EventSink = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_text<S>(read: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended early: {other:?}"),
        }
    }
}

#[tokio::test]
async fn full_exchange_over_a_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_uri = Arc::new(Mutex::new(String::new()));
    let server_uri = Arc::clone(&seen_uri);
    let pcm = vec![1u8, 0, 2, 0];
    let reply = BASE64.encode(&pcm);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            *server_uri.lock().unwrap() = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();
        let (mut write, mut read) = ws.split();

        let setup = next_text(&mut read).await;
        assert_eq!(setup["setup"]["model"], "models/live-model");
        assert_eq!(
            setup["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "switch_mode"
        );
        write
            .send(Message::Text(json!({ "setupComplete": {} }).to_string()))
            .await
            .unwrap();

        let input = next_text(&mut read).await;
        let chunk = &input["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], BASE64.encode([9u8, 9]));

        write
            .send(Message::Text(
                json!({ "serverContent": {
                    "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": reply } }] },
                    "turnComplete": true
                } })
                .to_string(),
            ))
            .await
            .unwrap();
        write
            .send(Message::Binary(
                json!({ "toolCall": { "functionCalls": [
                    { "name": "switch_mode", "args": { "mode": "chat" } }
                ] } })
                .to_string()
                .into_bytes(),
            ))
            .await
            .unwrap();
        write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "session over".into(),
            })))
            .await
            .unwrap();
    });

    let auth = Arc::new(AuthState::new(Some("live-key".into())));
    let mut transport = GeminiLiveTransport::new(format!("ws://{addr}/live"), auth);
    let (sink, mut rx) = collector();
    let channel = transport.open(request(), sink);

    assert_eq!(next_event(&mut rx).await, InboundEvent::Opened);
    channel.send_realtime_input(vec![9, 9]);
    assert_eq!(next_event(&mut rx).await, InboundEvent::Audio(pcm));
    assert_eq!(next_event(&mut rx).await, InboundEvent::TurnComplete);
    assert_eq!(
        next_event(&mut rx).await,
        InboundEvent::ToolInvocation {
            name: "switch_mode".into(),
            args: json!({ "mode": "chat" }),
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        InboundEvent::Closed {
            reason: Some("session over".into())
        }
    );

    server.await.unwrap();
    assert!(seen_uri.lock().unwrap().contains("key=live-key"));
}

#[tokio::test]
async fn abnormal_close_is_an_error_naming_the_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _setup = ws.next().await;
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "RESOURCE_EXHAUSTED".into(),
        })))
        .await
        .unwrap();
    });

    let auth = Arc::new(AuthState::new(Some("k".into())));
    let mut transport = GeminiLiveTransport::new(format!("ws://{addr}"), auth);
    let (sink, mut rx) = collector();
    let _channel = transport.open(request(), sink);

    let InboundEvent::Error(text) = next_event(&mut rx).await else {
        panic!("expected an error event");
    };
    assert!(text.contains("1011"), "{text}");
    assert_eq!(tradie::error::classify(&text), tradie::ErrorKind::QuotaExceeded);
    server.await.unwrap();
}

#[tokio::test]
async fn missing_credential_fails_without_connecting() {
    let auth = Arc::new(AuthState::new(None));
    let mut transport = GeminiLiveTransport::new("ws://127.0.0.1:9", auth);
    let (sink, mut rx) = collector();
    let _channel = transport.open(request(), sink);

    let InboundEvent::Error(text) = next_event(&mut rx).await else {
        panic!("expected an error event");
    };
    assert_eq!(
        tradie::error::classify(&text),
        tradie::ErrorKind::PermissionDenied
    );
}

#[tokio::test]
async fn closing_locally_sends_no_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let auth = Arc::new(AuthState::new(Some("k".into())));
    let mut transport = GeminiLiveTransport::new(format!("ws://{addr}"), auth);
    let (sink, mut rx) = collector();
    let mut channel = transport.open(request(), sink);
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.close();

    let quiet = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(!matches!(quiet, Ok(Some(_))), "unexpected event: {quiet:?}");
    server.abort();
}
