use serde::{Deserialize, Serialize};

/// Close code of a normal, client-initiated closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the connection ended without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection options passed to the transport on connect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,

    #[serde(default)]
    pub input_audio_transcription: bool,

    #[serde(default)]
    pub output_audio_transcription: bool,

    /// Client device metadata recorded with saved turns
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "device_info")]
    pub device_info: Option<serde_json::Value>,

    /// Client network metadata recorded with saved turns
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "network_info")]
    pub network_info: Option<serde_json::Value>,

    /// Options this crate does not interpret, forwarded verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Token accounting reported by the model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u32>,
}

/// Message streamed from the model
///
/// Unknown fields are ignored so newer protocol additions still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
}

impl ServerContent {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted == Some(true)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete == Some(true)
    }

    /// Base64 payloads of the PCM audio parts of the model turn
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| {
                blob.mime_type
                    .as_deref()
                    .is_some_and(|mime| mime.starts_with("audio/pcm"))
            })
            .filter_map(|blob| blob.data.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Transcription {
    /// The delta text, if non-empty
    pub fn delta(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Base64-encoded payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// A base64 media chunk sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    /// PCM16 audio at `sample_rate`
    pub fn pcm(sample_rate: u32, data: String) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            data,
        }
    }
}

/// Realtime input forwarded to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeInput {
    Media(MediaChunk),
    Text(String),
}

/// Why a transport connection closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
            was_clean: false,
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Transport-level error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }
}

/// One saved turn, handed to the interaction store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveInteractionPayload {
    pub user_message: String,
    pub assistant_message: String,
    pub user_message_tokens: u32,
    pub assistant_message_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// JSON-encoded device metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// JSON-encoded network metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_transcription_message() {
        let json = r#"{"serverContent":{"inputTranscription":{"text":"hi"},"outputTranscription":{"text":"Hel"}}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let content = msg.server_content.unwrap();

        assert_eq!(content.input_transcription.as_ref().unwrap().delta(), Some("hi"));
        assert_eq!(content.output_transcription.as_ref().unwrap().delta(), Some("Hel"));
        assert!(!content.is_interrupted());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let json = r#"{"goAway":{"timeLeft":"10s"},"sessionResumptionUpdate":{}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();

        assert_eq!(msg, ServerMessage::default());
    }

    #[test]
    fn test_audio_payloads_filter_mime() {
        let json = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
            {"inlineData":{"mimeType":"image/png","data":"BBB="}},
            {"text":"thinking"}
        ]}}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let content = msg.server_content.unwrap();
        let payloads: Vec<&str> = content.audio_payloads().collect();

        assert_eq!(payloads, vec!["AAA="]);
    }

    #[test]
    fn test_realtime_input_shape() {
        let input = RealtimeInput::Media(MediaChunk::pcm(16000, "AAAA".to_string()));
        let json = serde_json::to_string(&input).unwrap();

        assert_eq!(
            json,
            r#"{"media":{"mimeType":"audio/pcm;rate=16000","data":"AAAA"}}"#
        );
    }

    #[test]
    fn test_live_config_keeps_extra_options() {
        let json = r#"{"responseModalities":["AUDIO"],"device_info":{"os":"linux"},"speechConfig":{"languageCode":"en-IN"}}"#;
        let config: LiveConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.response_modalities, vec!["AUDIO"]);
        assert!(config.device_info.is_some());
        assert!(config.extra.contains_key("speechConfig"));
    }
}
