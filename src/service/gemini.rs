//! REST client for the hosted model (`generateContent`, streaming, speech,
//! image generation).

use super::sse::{SseEvent, SseLineParser};
use super::{
    AuthState, Completion, CompletionDelta, CompletionRequest, CompletionStream, GeneratedImage,
    ModelService,
};
use crate::chat::Citation;
use crate::config::ServiceConfig;
use crate::error::{AssistError, ErrorKind, Result, classify, classify_status};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    text_model: String,
    tts_model: String,
    image_model: String,
    voice: String,
    system_instruction: String,
    auth: Arc<AuthState>,
}

impl GeminiClient {
    pub fn new(config: &ServiceConfig, auth: Arc<AuthState>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            text_model: config.text_model.clone(),
            tts_model: config.tts_model.clone(),
            image_model: config.image_model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
            auth,
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{model}:{method}", self.base_url)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let key = self.auth.credential()?;
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status.as_u16(), &body_text));
        }
        Ok(response)
    }

    /// Map an HTTP error to a categorized error, invalidating the credential
    /// when it was rejected.
    fn map_http_error(&self, status: u16, body: &str) -> AssistError {
        let kind = classify_status(status, body);
        if kind == ErrorKind::PermissionDenied {
            self.auth.invalidate();
        }
        warn!(status, %kind, "model service request failed");
        kind.into_error(format!("HTTP {status}: {}", extract_error_message(body)))
    }
}

/// Categorize an error object embedded in a 200 response or stream event.
fn api_error(error: &ApiError, auth: &AuthState) -> AssistError {
    let text = format!("{} {}", error.status, error.message);
    let kind = classify_status(error.code, &text);
    if kind == ErrorKind::PermissionDenied {
        auth.invalidate();
    }
    kind.into_error(text.trim().to_owned())
}

fn map_transport_error(e: reqwest::Error) -> AssistError {
    if e.is_timeout() || e.is_connect() {
        return AssistError::Network(e.to_string());
    }
    match classify(&e.to_string()) {
        ErrorKind::Unknown => AssistError::Network(e.to_string()),
        kind => kind.into_error(e.to_string()),
    }
}

/// Pull `error.message` out of an error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

/// Request body for `generateContent` / `streamGenerateContent`.
pub fn completion_body(system_instruction: &str, request: &CompletionRequest) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    if let Some(att) = &request.attachment {
        parts.push(json!({
            "inlineData": { "mimeType": att.mime_type, "data": att.data }
        }));
    }
    let mut body = json!({
        "contents": [{ "role": "user", "parts": parts }],
    });
    if !system_instruction.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_instruction }] });
    }
    if request.grounding {
        body["tools"] = json!([{ "google_search": {} }]);
    }
    body
}

/// Request body for speech synthesis.
pub fn speech_body(text: &str, voice: &str) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": text }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }
        }
    })
}

/// Request body for image generation.
pub fn image_body(prompt: &str, aspect_ratio: &str) -> Value {
    json!({
        "instances": [{ "prompt": prompt }],
        "parameters": { "sampleCount": 1, "aspectRatio": aspect_ratio }
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
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
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

impl GenerateResponse {
    /// Text and citations of the first candidate.
    fn into_delta(self) -> Result<CompletionDelta> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
                return Err(AssistError::InvalidRequest(format!("prompt blocked: {reason}")));
            }
            return Ok(CompletionDelta::default());
        };

        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        let citations = candidate
            .grounding_metadata
            .map(|g| {
                g.grounding_chunks
                    .into_iter()
                    .filter_map(|c| c.web)
                    .filter(|w| !w.uri.is_empty())
                    .map(|w| Citation {
                        uri: w.uri,
                        title: w.title,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(CompletionDelta { text, citations })
    }

    /// First inline audio payload.
    fn into_audio(self) -> Option<InlineData> {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.inline_data)
            .find(|d| d.mime_type.starts_with("audio/") || d.mime_type.is_empty())
    }
}

fn parse_response(text: &str) -> Result<GenerateResponse> {
    serde_json::from_str(text)
        .map_err(|e| AssistError::Unknown(format!("unexpected response from model service: {e}")))
}

#[async_trait]
impl ModelService for GeminiClient {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = self.endpoint(&self.text_model, "generateContent");
        let body = completion_body(&self.system_instruction, request);
        let response = self.post(&url, &body).await?;
        let text = response.text().await.map_err(map_transport_error)?;

        let parsed = parse_response(&text)?;
        if let Some(err) = &parsed.error {
            return Err(api_error(err, &self.auth));
        }
        let delta = parsed.into_delta()?;
        debug!(chars = delta.text.len(), citations = delta.citations.len(), "completion");
        Ok(Completion {
            text: delta.text,
            citations: delta.citations,
        })
    }

    async fn complete_text_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&self.text_model, "streamGenerateContent")
        );
        let body = completion_body(&self.system_instruction, request);
        let response = self.post(&url, &body).await?;
        let mut bytes = Box::pin(response.bytes_stream());
        let auth = Arc::clone(&self.auth);

        let stream = async_stream::try_stream! {
            let mut parser = SseLineParser::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| AssistError::Network(format!("stream read error: {e}")))?;
                for event in parser.push(&chunk) {
                    if let Some(delta) = parse_stream_event(&event, &auth)? {
                        yield delta;
                    }
                }
            }
            if let Some(event) = parser.flush() {
                if let Some(delta) = parse_stream_event(&event, &auth)? {
                    yield delta;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn synthesize_speech(&self, text: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(&self.tts_model, "generateContent");
        let response = self.post(&url, &speech_body(text, &self.voice)).await?;
        let text = response.text().await.map_err(map_transport_error)?;

        let parsed = parse_response(&text)?;
        if let Some(err) = &parsed.error {
            return Err(api_error(err, &self.auth));
        }
        let audio = parsed
            .into_audio()
            .ok_or_else(|| AssistError::Decode("speech response carried no audio".into()))?;
        BASE64
            .decode(audio.data.as_bytes())
            .map_err(|e| AssistError::Decode(format!("speech audio is not base64: {e}")))
    }

    async fn generate_image(&self, prompt: &str, size_hint: &str) -> Result<GeneratedImage> {
        let url = self.endpoint(&self.image_model, "predict");
        let response = self.post(&url, &image_body(prompt, size_hint)).await?;
        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| AssistError::Unknown(format!("unexpected image response: {e}")))?;

        let prediction = parsed
            .predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| {
                AssistError::InvalidRequest("no image returned; the prompt may have been blocked".into())
            })?;
        let data = prediction.bytes_base64_encoded.unwrap_or_default();
        let bytes = BASE64
            .decode(data.as_bytes())
            .map_err(|e| AssistError::Decode(format!("image is not base64: {e}")))?;
        Ok(GeneratedImage {
            bytes,
            mime_type: prediction.mime_type.unwrap_or_else(|| "image/png".to_owned()),
        })
    }
}

/// Decode one streamed event. `None` for empty increments and sentinels.
fn parse_stream_event(event: &SseEvent, auth: &AuthState) -> Result<Option<CompletionDelta>> {
    if event.is_done() || event.data.trim().is_empty() {
        return Ok(None);
    }
    let parsed = parse_response(&event.data)?;
    if let Some(err) = &parsed.error {
        return Err(api_error(err, auth));
    }
    let delta = parsed.into_delta()?;
    if delta.text.is_empty() && delta.citations.is_empty() {
        return Ok(None);
    }
    Ok(Some(delta))
}
