use crate::session::LiveConfig;
use crate::voice::VoiceSession;
use std::sync::Arc;

/// Connect parameters used when a request leaves them out
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub model: String,
    pub config: LiveConfig,
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The voice call controlled by this server
    pub voice: Arc<VoiceSession>,

    pub defaults: Arc<SessionDefaults>,
}

impl AppState {
    pub fn new(voice: Arc<VoiceSession>, defaults: SessionDefaults) -> Self {
        Self {
            voice,
            defaults: Arc::new(defaults),
        }
    }
}
