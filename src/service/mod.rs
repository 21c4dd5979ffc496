//! Request/response calls to the hosted model.
//!
//! [`ModelService`] is the seam the runtime talks to; [`GeminiClient`] is the
//! production implementation. [`AuthState`] is shared by every caller (REST
//! and live) so a rejected credential stops all traffic until the user
//! re-authenticates.

pub mod gemini;
pub mod sse;

pub use gemini::GeminiClient;

use crate::chat::{Attachment, Citation};
use crate::error::{AssistError, Result};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// A text completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub attachment: Option<Attachment>,
    /// Ask the service to ground the answer in search results.
    pub grounding: bool,
}

/// A complete reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// One increment of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionDelta {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// A generated image.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Finite, non-restartable stream of reply increments.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionDelta>> + Send>>;

/// The hosted model's request/response surface.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<Completion>;

    async fn complete_text_stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;

    /// Synthesize speech; returns 16-bit mono PCM at [`SPEECH_SAMPLE_RATE`].
    async fn synthesize_speech(&self, text: &str) -> Result<Vec<u8>>;

    /// Generate one image. `size_hint` is an aspect ratio such as `16:9`.
    async fn generate_image(&self, prompt: &str, size_hint: &str) -> Result<GeneratedImage>;
}

/// Sample rate of synthesized speech.
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

/// Credential plus the process-wide "caller is authorized" flag.
#[derive(Debug)]
pub struct AuthState {
    api_key: Mutex<Option<String>>,
    authorized: AtomicBool,
}

impl AuthState {
    pub fn new(api_key: Option<String>) -> Self {
        let authorized = api_key.is_some();
        Self {
            api_key: Mutex::new(api_key),
            authorized: AtomicBool::new(authorized),
        }
    }

    /// The key to send, or `PermissionDenied` if re-authentication is needed.
    pub fn credential(&self) -> Result<String> {
        if !self.authorized.load(Ordering::Acquire) {
            return Err(AssistError::PermissionDenied(
                "not authorized; re-authentication required".into(),
            ));
        }
        self.api_key
            .lock()
            .ok()
            .and_then(|k| k.clone())
            .ok_or_else(|| AssistError::PermissionDenied("no API key configured".into()))
    }

    /// Forget that the caller is authorized. Every request fails fast until
    /// [`authorize`](Self::authorize).
    pub fn invalidate(&self) {
        if self.authorized.swap(false, Ordering::AcqRel) {
            warn!("credential rejected; re-authentication required");
        }
    }

    /// Install a (new) key and mark the caller authorized.
    pub fn authorize(&self, api_key: impl Into<String>) {
        match self.api_key.lock() {
            Ok(mut k) => *k = Some(api_key.into()),
            Err(e) => {
                warn!("auth state poisoned: {e}");
                return;
            }
        }
        self.authorized.store(true, Ordering::Release);
        info!("credential installed");
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }
}
