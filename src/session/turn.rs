use super::messages::{LiveConfig, SaveInteractionPayload, UsageMetadata};

/// User transcripts that carry no content worth saving
const NOISE_TRANSCRIPTS: &[&str] = &["<noise>", "."];

/// Transcript and usage accumulated for the in-progress turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    pub user_transcript: String,
    pub assistant_transcript: String,
    pub is_interrupted: bool,
    pub usage: Option<UsageMetadata>,
}

impl TurnState {
    pub fn append_input(&mut self, text: &str) {
        self.user_transcript.push_str(text);
    }

    /// Append assistant text unless the turn was interrupted
    pub fn append_output(&mut self, text: &str) -> bool {
        if self.is_interrupted {
            return false;
        }
        self.assistant_transcript.push_str(text);
        true
    }

    pub fn has_transcript(&self) -> bool {
        !self.user_transcript.is_empty() || !self.assistant_transcript.is_empty()
    }

    /// Take the accumulated state, leaving an empty turn behind
    pub fn take(&mut self) -> TurnState {
        std::mem::take(self)
    }
}

impl SaveInteractionPayload {
    /// Build the record for a flushed turn
    ///
    /// Returns `None` when the turn holds nothing worth saving: no assistant
    /// text and a user text that is empty or noise.
    pub fn from_turn(
        turn: TurnState,
        discard_user: bool,
        session_id: Option<String>,
        config: Option<&LiveConfig>,
    ) -> Option<Self> {
        let user = if discard_user {
            ""
        } else {
            turn.user_transcript.trim()
        };
        let assistant = turn.assistant_transcript.trim();

        let user_is_noise = user.is_empty() || NOISE_TRANSCRIPTS.contains(&user);
        if user_is_noise && assistant.is_empty() {
            return None;
        }

        let usage = turn.usage.unwrap_or_default();
        let encode = |value: Option<&serde_json::Value>| value.map(|v| v.to_string());

        Some(Self {
            user_message: user.to_string(),
            assistant_message: assistant.to_string(),
            user_message_tokens: usage.prompt_token_count.unwrap_or(0),
            assistant_message_tokens: usage.response_token_count.unwrap_or(0),
            session_id,
            device: encode(config.and_then(|c| c.device_info.as_ref())),
            network: encode(config.and_then(|c| c.network_info.as_ref())),
        })
    }
}
