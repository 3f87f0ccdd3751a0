pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod nats;
pub mod session;
pub mod voice;

pub use audio::{
    AudioCapturePipeline, CaptureBackend, CaptureConfig, CaptureEvent, ContextRegistry,
    OutputContext, PlaybackConfig, PlaybackScheduler,
};
pub use config::Config;
pub use error::{DeviceAcquisitionError, Error, Result};
pub use http::{create_router, AppState};
pub use nats::NatsClient;
pub use session::{ConnectionState, LiveConfig, SessionClient, SessionEvent};
pub use voice::{CaptureOptions, VoiceSession};
