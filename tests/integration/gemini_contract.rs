//! Contract tests for the REST client: request shape, response parsing,
//! streamed replies and error mapping.

use crate::helpers::{client_for, text_response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde_json::json;
use tradie::ErrorKind;
use tradie::chat::Attachment;
use tradie::service::{CompletionRequest, ModelService};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn prompt(text: &str) -> CompletionRequest {
    CompletionRequest {
        prompt: text.into(),
        ..CompletionRequest::default()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Completions
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completion_sends_key_prompt_and_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/text-model:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{ "role": "user", "parts": [{ "text": "Min cover for a slab?" }] }],
            "systemInstruction": { "parts": [{ "text": "Be brief." }] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("40 mm internal.")))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let reply = client.complete_text(&prompt("Min cover for a slab?")).await.unwrap();
    assert_eq!(reply.text, "40 mm internal.");
    assert!(reply.citations.is_empty());
}

#[tokio::test]
async fn attachment_and_grounding_are_sent() {
    let server = MockServer::start().await;
    let attachment = Attachment::from_bytes("site.jpg", "image/jpeg", b"\xff\xd8\xff");
    Mock::given(method("POST"))
        .and(path("/v1beta/models/text-model:generateContent"))
        .and(body_partial_json(json!({
            "tools": [{ "google_search": {} }]
        })))
        .and(body_partial_json(json!({
            "contents": [{ "parts": [
                { "text": "what is this?" },
                { "inlineData": { "mimeType": "image/jpeg", "data": attachment.data } }
            ] }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "A bearer." }] },
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://example.org/bearers", "title": "Bearers" } },
                    { "web": { "uri": "", "title": "empty" } }
                ] }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let request = CompletionRequest {
        prompt: "what is this?".into(),
        attachment: Some(attachment.clone()),
        grounding: true,
    };
    let reply = client.complete_text(&request).await.unwrap();
    assert_eq!(reply.text, "A bearer.");
    assert_eq!(reply.citations.len(), 1);
    assert_eq!(reply.citations[0].title, "Bearers");
}

#[tokio::test]
async fn blocked_prompt_is_an_invalid_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let err = client.complete_text(&prompt("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn streamed_reply_yields_increments_in_order() {
    let server = MockServer::start().await;
    let body = [
        format!("data: {}\n\n", text_response("Use ")),
        format!("data: {}\n\n", text_response("M12 ")),
        format!("data: {}\n\n", text_response("bolts.")),
    ]
    .concat();
    Mock::given(method("POST"))
        .and(path("/v1beta/models/text-model:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let mut stream = client
        .complete_text_stream(&prompt("bolt size?"))
        .await
        .unwrap();
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        text.push_str(&delta.unwrap().text);
    }
    assert_eq!(text, "Use M12 bolts.");
}

#[tokio::test]
async fn error_event_mid_stream_ends_the_stream_with_its_kind() {
    let server = MockServer::start().await;
    let body = [
        format!("data: {}\n\n", text_response("partial")),
        format!(
            "data: {}\n\n",
            json!({ "error": { "code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" } })
        ),
    ]
    .concat();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let mut stream = client.complete_text_stream(&prompt("x")).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().text, "partial");
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
}

// ────────────────────────────────────────────────────────────────────────────
// Errors and credentials
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_maps_to_quota_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED" }
        })))
        .mount(&server)
        .await;

    let (client, auth) = client_for(&server.uri());
    let err = client.complete_text(&prompt("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(err.detail().contains("Resource has been exhausted"));
    assert!(auth.is_authorized());
}

#[tokio::test]
async fn server_error_maps_to_service_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("The model is overloaded."))
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let err = client.complete_text(&prompt("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    assert!(err.kind().is_transient());
}

#[tokio::test]
async fn rejected_key_blocks_further_requests_until_reauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "stale-key"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": 403, "message": "API key not valid.", "status": "PERMISSION_DENIED" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("x-goog-api-key", "fresh-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let (client, auth) = client_for(&server.uri());
    auth.authorize("stale-key");

    let err = client.complete_text(&prompt("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!auth.is_authorized());

    // Fails fast without reaching the server.
    let err = client.synthesize_speech("x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    auth.authorize("fresh-key");
    assert_eq!(client.complete_text(&prompt("x")).await.unwrap().text, "ok");
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let (client, _) = client_for("http://127.0.0.1:9");
    let err = client.complete_text(&prompt("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

// ────────────────────────────────────────────────────────────────────────────
// Speech and images
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn speech_returns_decoded_pcm() {
    let server = MockServer::start().await;
    let pcm = vec![0x00, 0x10, 0xff, 0x7f];
    Mock::given(method("POST"))
        .and(path("/v1beta/models/tts-model:generateContent"))
        .and(body_partial_json(json!({
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": { "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } } }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{
                "inlineData": { "mimeType": "audio/L16;codec=pcm;rate=24000", "data": BASE64.encode(&pcm) }
            }] } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    assert_eq!(client.synthesize_speech("Job done.").await.unwrap(), pcm);
}

#[tokio::test]
async fn speech_without_audio_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("no audio")))
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let err = client.synthesize_speech("x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn image_generation_sends_aspect_ratio_and_decodes_bytes() {
    let server = MockServer::start().await;
    let png = b"\x89PNG\r\n\x1a\n".to_vec();
    Mock::given(method("POST"))
        .and(path("/v1beta/models/image-model:predict"))
        .and(body_partial_json(json!({
            "instances": [{ "prompt": "a retaining wall" }],
            "parameters": { "sampleCount": 1, "aspectRatio": "16:9" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "predictions": [{ "bytesBase64Encoded": BASE64.encode(&png), "mimeType": "image/png" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let image = client.generate_image("a retaining wall", "16:9").await.unwrap();
    assert_eq!(image.bytes, png);
    assert_eq!(image.mime_type, "image/png");
}

#[tokio::test]
async fn empty_predictions_are_an_invalid_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "predictions": [] })))
        .mount(&server)
        .await;

    let (client, _) = client_for(&server.uri());
    let err = client.generate_image("x", "1:1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
