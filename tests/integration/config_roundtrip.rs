//! A config file on disk drives the service client.

use crate::helpers::text_response;
use std::sync::Arc;
use tradie::AssistConfig;
use tradie::service::{AuthState, CompletionRequest, GeminiClient, ModelService};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn service_settings_from_toml_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/site-model:generateContent"))
        .and(body_partial_json(serde_json::json!({
            "systemInstruction": { "parts": [{ "text": "Answer in metric." }] },
            "tools": [{ "google_search": {} }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_response("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("config.toml");
    std::fs::write(
        &file,
        format!(
            r#"
            [service]
            base_url = "{}/"
            text_model = "site-model"
            system_instruction = "Answer in metric."
            grounding = true

            [ui]
            speak_responses = true
            "#,
            server.uri()
        ),
    )
    .unwrap();

    let config = AssistConfig::load_or_default(&file).unwrap();
    assert!(config.ui.speak_responses);
    assert_eq!(config.audio.input_sample_rate, 16_000);

    let auth = Arc::new(AuthState::new(Some("k".into())));
    let client = GeminiClient::new(&config.service, auth);
    let request = CompletionRequest {
        prompt: "joist spacing?".into(),
        grounding: config.service.grounding,
        ..CompletionRequest::default()
    };
    assert_eq!(client.complete_text(&request).await.unwrap().text, "ok");
}

#[test]
fn saved_config_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("tradie").join("config.toml");

    let mut config = AssistConfig::default();
    config.image.aspect_ratio = "4:3".into();
    config.dictation.locale = "en-NZ".into();
    config.audio.input_device = Some("USB Headset".into());
    config.save_to_file(&file).unwrap();

    let loaded = AssistConfig::from_file(&file).unwrap();
    assert_eq!(loaded.image.aspect_ratio, "4:3");
    assert_eq!(loaded.dictation.locale, "en-NZ");
    assert_eq!(loaded.audio.input_device.as_deref(), Some("USB Headset"));
    assert_eq!(loaded.audio.output_device, None);
}
