use serde::{Deserialize, Serialize};

use crate::session::LiveConfig;

/// Session setup published to the model bridge when a channel opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupMessage {
    pub channel: String,
    pub model: String,
    pub config: LiveConfig,
    pub timestamp: String, // RFC3339 timestamp
}

/// Client-side close marker for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub channel: String,
    pub code: u16,
    pub reason: String,
    pub timestamp: String,
}

/// Subjects of one live channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSubjects {
    pub setup: String,
    pub input: String,
    pub close: String,
    pub server: String,
}

impl LiveSubjects {
    pub fn new(prefix: &str, channel: &str) -> Self {
        let base = format!("{}.{}", prefix, channel);
        Self {
            setup: format!("{}.setup", base),
            input: format!("{}.input", base),
            close: format!("{}.close", base),
            server: format!("{}.server", base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_layout() {
        let subjects = LiveSubjects::new("live.session", "abc");

        assert_eq!(subjects.setup, "live.session.abc.setup");
        assert_eq!(subjects.input, "live.session.abc.input");
        assert_eq!(subjects.close, "live.session.abc.close");
        assert_eq!(subjects.server, "live.session.abc.server");
    }

    #[test]
    fn test_setup_message_embeds_config() {
        let message = SetupMessage {
            channel: "abc".to_string(),
            model: "models/live-audio".to_string(),
            config: LiveConfig {
                response_modalities: vec!["AUDIO".to_string()],
                ..Default::default()
            },
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["model"], "models/live-audio");
        assert_eq!(value["config"]["responseModalities"][0], "AUDIO");
    }
}
