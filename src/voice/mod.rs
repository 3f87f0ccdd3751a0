//! Voice call orchestration

mod session;

pub use session::{CaptureOptions, VoiceConfig, VoiceSession, OUTPUT_CONTEXT_ID};
