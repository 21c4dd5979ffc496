//! Bidirectional live audio sessions with the hosted model.

pub mod gemini;
pub mod session;
pub mod transport;

pub use gemini::GeminiLiveTransport;
pub use session::{LiveSession, SessionEffect, SessionEvent, SessionSignal, SessionState};
pub use transport::{DuplexChannel, DuplexTransport, InboundEvent, SessionRequest};
