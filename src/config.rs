//! Configuration types for the assistant.

use crate::error::{AssistError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    /// Remote model service settings.
    pub service: ServiceConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Status indicator and chat behavior.
    pub ui: UiConfig,
    /// Dictation settings.
    pub dictation: DictationConfig,
    /// Image generation settings.
    pub image: ImageConfig,
}

/// Remote model service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL for request/response calls.
    pub base_url: String,
    /// WebSocket URL of the bidirectional live endpoint.
    pub live_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model used for chat completions.
    pub text_model: String,
    /// Model used for live duplex sessions.
    pub live_model: String,
    /// Model used for speech synthesis.
    pub tts_model: String,
    /// Model used for image generation.
    pub image_model: String,
    /// Prebuilt voice name for synthesized and live speech.
    pub voice: String,
    /// System instruction sent with every request and live session.
    pub system_instruction: String,
    /// Whether chat requests enable search grounding (citations).
    pub grounding: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_owned(),
            live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            api_key_env: "GEMINI_API_KEY".to_owned(),
            text_model: "gemini-2.5-flash".to_owned(),
            live_model: "gemini-2.0-flash-live-001".to_owned(),
            tts_model: "gemini-2.5-flash-preview-tts".to_owned(),
            image_model: "imagen-3.0-generate-002".to_owned(),
            voice: "Kore".to_owned(),
            system_instruction: "You are a practical assistant for Australian and New Zealand \
                tradespeople. Answer concisely and cite the relevant standard when one applies."
                .to_owned(),
            grounding: true,
        }
    }
}

impl ServiceConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of outbound (captured) frames in Hz.
    pub input_sample_rate: u32,
    /// Sample rate of inbound (model) audio in Hz.
    pub output_sample_rate: u32,
    /// Samples per capture tick.
    pub block_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            block_size: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Status indicator and chat behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Seconds before an error shown on the orb clears itself.
    pub error_clear_secs: f64,
    /// Read finished chat replies aloud.
    pub speak_responses: bool,
    /// Stream chat replies incrementally instead of waiting for the full text.
    pub stream_chat: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            error_clear_secs: 5.0,
            speak_responses: false,
            stream_chat: true,
        }
    }
}

/// Dictation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DictationConfig {
    /// BCP-47 locale passed to the dictation service.
    pub locale: String,
}

impl Default for DictationConfig {
    fn default() -> Self {
        Self {
            locale: "en-AU".to_owned(),
        }
    }
}

/// Image generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Aspect ratio hint, e.g. `1:1`, `16:9`.
    pub aspect_ratio: String,
    /// Directory generated images are written to by the host.
    pub output_dir: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: "1:1".to_owned(),
            output_dir: std::env::temp_dir().join("tradie-images"),
        }
    }
}

impl AssistConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AssistError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AssistError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/tradie/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tradie")
            .join("config.toml")
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}
