//! HTTP API for local control of the voice call
//!
//! - GET /health - Health check
//! - GET /session/status - Connection, speaking, volume and mute state
//! - POST /session/connect - Open a live session
//! - POST /session/disconnect - Close the live session
//! - POST /session/text - Send a text turn
//! - POST /capture/start, /capture/stop, /capture/mute - Microphone control
//! - GET/POST /devices/output - List or switch output devices

mod handlers;
mod routes;
mod state;

pub use handlers::{OutputDevicesResponse, StatusResponse};
pub use routes::create_router;
pub use state::{AppState, SessionDefaults};
