//! Error taxonomy for the assistant.
//!
//! Every failure that crosses a boundary (remote model service, duplex
//! channel, audio device) is converted into an [`AssistError`] at that
//! boundary. Callers only ever need [`AssistError::kind`] to decide what to
//! show the user and whether the failure is transient.

use std::fmt;

/// Top-level error type for the assistant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssistError {
    /// The caller is not (or no longer) authorized; re-authentication is required.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The service rejected the request because a quota or rate limit was hit.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The service is temporarily unavailable or overloaded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Microphone permission denied or no input device present.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Malformed audio payload.
    #[error("audio decode error: {0}")]
    Decode(String),

    /// Connection-level failure (DNS, TLS, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The service rejected the request as malformed or unsafe.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Anything that did not match a more specific category.
    #[error("{0}")]
    Unknown(String),
}

/// Fieldless error category, used for classification and user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    QuotaExceeded,
    ServiceUnavailable,
    DeviceUnavailable,
    Decode,
    Network,
    InvalidRequest,
    Config,
    Io,
    Unknown,
}

impl ErrorKind {
    /// The fixed message shown in the status indicator for this category.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => "Access denied. Please sign in again and retry.",
            Self::QuotaExceeded => "Usage limit reached. Please wait a moment and try again.",
            Self::ServiceUnavailable => "The assistant is busy right now. Please try again shortly.",
            Self::DeviceUnavailable => {
                "Microphone unavailable. Check that a microphone is connected and access is allowed."
            }
            Self::Decode => "Received audio could not be played.",
            Self::Network => "Network problem. Check your connection and try again.",
            Self::InvalidRequest => "That request couldn't be processed. Try rephrasing it.",
            Self::Config => "Configuration problem. Please check your settings.",
            Self::Io => "A file could not be read or written.",
            Self::Unknown => "Something went wrong. Please try again.",
        }
    }

    /// Whether the user can simply retry.
    ///
    /// Only `PermissionDenied` and `Config` need user intervention first.
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::Config)
    }

    /// Wrap a detail string in the matching [`AssistError`] variant.
    pub fn into_error(self, detail: impl Into<String>) -> AssistError {
        let detail = detail.into();
        match self {
            Self::PermissionDenied => AssistError::PermissionDenied(detail),
            Self::QuotaExceeded => AssistError::QuotaExceeded(detail),
            Self::ServiceUnavailable => AssistError::ServiceUnavailable(detail),
            Self::DeviceUnavailable => AssistError::DeviceUnavailable(detail),
            Self::Decode => AssistError::Decode(detail),
            Self::Network => AssistError::Network(detail),
            Self::InvalidRequest => AssistError::InvalidRequest(detail),
            Self::Config => AssistError::Config(detail),
            Self::Io => AssistError::Io(detail),
            Self::Unknown => AssistError::Unknown(detail),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionDenied => "permission_denied",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ServiceUnavailable => "service_unavailable",
            Self::DeviceUnavailable => "device_unavailable",
            Self::Decode => "decode_error",
            Self::Network => "network",
            Self::InvalidRequest => "invalid_request",
            Self::Config => "config",
            Self::Io => "io",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl AssistError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Network(_) => ErrorKind::Network,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Returns the inner detail without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            Self::PermissionDenied(m)
            | Self::QuotaExceeded(m)
            | Self::ServiceUnavailable(m)
            | Self::DeviceUnavailable(m)
            | Self::Decode(m)
            | Self::Network(m)
            | Self::InvalidRequest(m)
            | Self::Config(m)
            | Self::Io(m)
            | Self::Unknown(m) => m,
        }
    }

    /// The fixed user-facing message for this error's category.
    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }

    /// Build an error from free text (close reasons, provider messages).
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        classify(&text).into_error(text)
    }
}

impl From<std::io::Error> for AssistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Ordered classification table, most specific patterns first.
///
/// Patterns are matched against the lowercased text.
const CLASSIFICATION_TABLE: &[(&str, ErrorKind)] = &[
    ("notallowederror", ErrorKind::DeviceUnavailable),
    ("notfounderror", ErrorKind::DeviceUnavailable),
    ("microphone", ErrorKind::DeviceUnavailable),
    ("input device", ErrorKind::DeviceUnavailable),
    ("api key not valid", ErrorKind::PermissionDenied),
    ("api_key_invalid", ErrorKind::PermissionDenied),
    ("permission_denied", ErrorKind::PermissionDenied),
    ("permission denied", ErrorKind::PermissionDenied),
    ("unauthenticated", ErrorKind::PermissionDenied),
    ("resource_exhausted", ErrorKind::QuotaExceeded),
    ("quota", ErrorKind::QuotaExceeded),
    ("rate limit", ErrorKind::QuotaExceeded),
    ("too many requests", ErrorKind::QuotaExceeded),
    ("overloaded", ErrorKind::ServiceUnavailable),
    ("unavailable", ErrorKind::ServiceUnavailable),
    ("deadline_exceeded", ErrorKind::ServiceUnavailable),
    ("internal error", ErrorKind::ServiceUnavailable),
    ("invalid_argument", ErrorKind::InvalidRequest),
    ("safety", ErrorKind::InvalidRequest),
    ("blocked", ErrorKind::InvalidRequest),
    ("connection refused", ErrorKind::Network),
    ("connection reset", ErrorKind::Network),
    ("dns", ErrorKind::Network),
    ("timed out", ErrorKind::Network),
    ("network", ErrorKind::Network),
];

/// HTTP statuses recognised in free text. Only whole tokens match, so
/// `15003` is not a `500`.
const STATUS_TOKENS: &[(&str, ErrorKind)] = &[
    ("401", ErrorKind::PermissionDenied),
    ("403", ErrorKind::PermissionDenied),
    ("429", ErrorKind::QuotaExceeded),
    ("500", ErrorKind::ServiceUnavailable),
    ("502", ErrorKind::ServiceUnavailable),
    ("503", ErrorKind::ServiceUnavailable),
    ("504", ErrorKind::ServiceUnavailable),
];

/// Classify free error text into an [`ErrorKind`].
///
/// Text patterns win; a bare status code is the fallback.
pub fn classify(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    if let Some((_, kind)) = CLASSIFICATION_TABLE
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
    {
        return *kind;
    }
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|token| {
            STATUS_TOKENS
                .iter()
                .find(|(code, _)| *code == token)
                .map(|(_, kind)| *kind)
        })
        .unwrap_or(ErrorKind::Unknown)
}

/// Classify an HTTP status plus response body.
///
/// The status decides when it is unambiguous; otherwise the body text does.
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::PermissionDenied,
        429 => ErrorKind::QuotaExceeded,
        500 | 502 | 503 | 504 => ErrorKind::ServiceUnavailable,
        400 => match classify(body) {
            ErrorKind::Unknown => ErrorKind::InvalidRequest,
            kind => kind,
        },
        _ => classify(body),
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistError>;
