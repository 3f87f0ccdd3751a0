use super::state::AppState;
use crate::audio::OutputDevice;
use crate::session::{ConnectionState, LiveConfig};
use crate::voice::CaptureOptions;
use crate::Error;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    /// Model name (default from config)
    pub model: Option<String>,

    /// Session options (default from config)
    pub config: Option<LiveConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SetOutputRequest {
    pub device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ConnectionState,
    pub connected: bool,
    pub is_speaking: bool,
    pub volume: f32,
    pub input_volume: f32,
    pub is_muted: bool,
    pub capturing: bool,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub session_id: Option<String>,
    pub model: String,
    pub status: ConnectionState,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub disconnected: bool,
    pub status: ConnectionState,
}

#[derive(Debug, Serialize)]
pub struct MuteResponse {
    pub muted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutputDevicesResponse {
    pub devices: Vec<OutputDevice>,
    pub active: Option<OutputDevice>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /session/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let voice = &state.voice;
    let client = voice.client();

    Json(StatusResponse {
        status: client.status(),
        connected: voice.connected(),
        is_speaking: voice.is_speaking(),
        volume: voice.volume(),
        input_volume: voice.input_volume(),
        is_muted: voice.is_muted(),
        capturing: voice.is_active(),
        session_id: client.session_id(),
        model: client.model(),
    })
}

/// POST /session/connect
/// Open a live session with the requested or default model
pub async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let status = state.voice.client().status();
    if matches!(status, ConnectionState::Connected | ConnectionState::Connecting) {
        return error_response(
            StatusCode::CONFLICT,
            format!("Session is already {}", status),
        );
    }

    let model = req.model.unwrap_or_else(|| state.defaults.model.clone());
    let config = req.config.unwrap_or_else(|| state.defaults.config.clone());

    info!("Connecting live session (model: {})", model);

    if !state.voice.connect(&model, config).await {
        error!("Failed to connect live session");
        return error_response(
            StatusCode::BAD_GATEWAY,
            "Failed to connect live session".to_string(),
        );
    }

    (
        StatusCode::OK,
        Json(ConnectResponse {
            session_id: state.voice.client().session_id(),
            model,
            status: state.voice.client().status(),
        }),
    )
        .into_response()
}

/// POST /session/disconnect
pub async fn disconnect(State(state): State<AppState>) -> impl IntoResponse {
    let disconnected = state.voice.disconnect().await;

    Json(DisconnectResponse {
        disconnected,
        status: state.voice.client().status(),
    })
}

/// POST /session/text
/// Send a text turn to the connected session
pub async fn send_text(State(state): State<AppState>, Json(req): Json<TextRequest>) -> Response {
    if !state.voice.connected() {
        return error_response(StatusCode::CONFLICT, "Session is not connected".to_string());
    }

    state.voice.send_text(&req.text);
    StatusCode::ACCEPTED.into_response()
}

/// POST /capture/start
/// Start streaming the microphone to the session
pub async fn start_capture(
    State(state): State<AppState>,
    Json(options): Json<CaptureOptions>,
) -> Response {
    match state.voice.start(options).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(Error::DeviceAcquisition(e)) => {
            error!("Failed to acquire input device: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            error!("Failed to start capture: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start capture: {}", e),
            )
        }
    }
}

/// POST /capture/stop
pub async fn stop_capture(State(state): State<AppState>) -> impl IntoResponse {
    state.voice.stop().await;
    StatusCode::OK
}

/// POST /capture/mute
/// Toggle the microphone mute state
pub async fn toggle_mute(State(state): State<AppState>) -> impl IntoResponse {
    Json(MuteResponse {
        muted: state.voice.toggle_mute(),
    })
}

/// GET /devices/output
pub async fn list_output_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(OutputDevicesResponse {
        devices: state.voice.output_devices(),
        active: state.voice.active_output_device(),
    })
}

/// POST /devices/output
/// Route model audio to another output device
pub async fn set_output_device(
    State(state): State<AppState>,
    Json(req): Json<SetOutputRequest>,
) -> Response {
    match state.voice.set_audio_output(&req.device_id) {
        Ok(()) => Json(OutputDevicesResponse {
            devices: state.voice.output_devices(),
            active: state.voice.active_output_device(),
        })
        .into_response(),
        Err(Error::Device(message)) => error_response(StatusCode::NOT_FOUND, message),
        Err(e) => {
            error!("Failed to set audio output device: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to set audio output device: {}", e),
            )
        }
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
