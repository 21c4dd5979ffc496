//! Shared helpers for integration tests.

use std::sync::Arc;
use tradie::config::ServiceConfig;
use tradie::service::{AuthState, GeminiClient};

/// A client pointed at `base_url` with a valid test key.
pub(crate) fn client_for(base_url: &str) -> (GeminiClient, Arc<AuthState>) {
    let config = ServiceConfig {
        base_url: base_url.to_owned(),
        text_model: "text-model".into(),
        tts_model: "tts-model".into(),
        image_model: "image-model".into(),
        system_instruction: "Be brief.".into(),
        grounding: false,
        ..ServiceConfig::default()
    };
    let auth = Arc::new(AuthState::new(Some("test-key".into())));
    (GeminiClient::new(&config, Arc::clone(&auth)), auth)
}

/// A `generateContent` body carrying `text`.
pub(crate) fn text_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] }
        }]
    })
}
