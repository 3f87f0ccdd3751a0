use live_voice::nats::{CloseMessage, LiveSubjects, SetupMessage};
use live_voice::session::{LiveConfig, SaveInteractionPayload, NORMAL_CLOSURE};

#[test]
fn test_setup_message_serialization() {
    let msg = SetupMessage {
        channel: "3f1c".to_string(),
        model: "models/live-audio".to_string(),
        config: LiveConfig {
            response_modalities: vec!["AUDIO".to_string()],
            system_instruction: Some("Be brief".to_string()),
            input_audio_transcription: true,
            output_audio_transcription: true,
            ..Default::default()
        },
        timestamp: "2025-10-27T14:30:00Z".to_string(),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"channel\":\"3f1c\""));
    assert!(json.contains("Be brief"));

    let deserialized: SetupMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, msg);
}

#[test]
fn test_close_message_serialization() {
    let msg = CloseMessage {
        channel: "3f1c".to_string(),
        code: NORMAL_CLOSURE,
        reason: "Client closed".to_string(),
        timestamp: "2025-10-27T14:30:00Z".to_string(),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"code\":1000"));

    let deserialized: CloseMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.reason, "Client closed");
}

#[test]
fn test_channels_use_separate_subjects() {
    let first = LiveSubjects::new("live.session", "one");
    let second = LiveSubjects::new("live.session", "two");

    assert_ne!(first.input, second.input);
    assert_ne!(first.server, second.server);
    assert!(first.server.starts_with("live.session.one."));
}

#[test]
fn test_interaction_payload_skips_missing_metadata() {
    let payload = SaveInteractionPayload {
        user_message: "What time is it?".to_string(),
        assistant_message: "It is noon.".to_string(),
        user_message_tokens: 12,
        assistant_message_tokens: 30,
        session_id: Some("3f1c".to_string()),
        device: None,
        network: None,
    };

    let value = serde_json::to_value(&payload).unwrap();

    assert_eq!(value["user_message"], "What time is it?");
    assert_eq!(value["assistant_message_tokens"], 30);
    assert_eq!(value["session_id"], "3f1c");
    assert!(value.get("device").is_none());
    assert!(value.get("network").is_none());
}

#[test]
fn test_interaction_payload_carries_encoded_metadata() {
    let json = r#"{
        "user_message": "hi",
        "assistant_message": "hello",
        "user_message_tokens": 1,
        "assistant_message_tokens": 2,
        "device": "{\"os\":\"linux\"}"
    }"#;

    let payload: SaveInteractionPayload = serde_json::from_str(json).unwrap();

    assert_eq!(payload.session_id, None);
    let device: serde_json::Value = serde_json::from_str(payload.device.as_deref().unwrap()).unwrap();
    assert_eq!(device["os"], "linux");
}
