use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// No usable audio input device could be opened
#[derive(Debug, Clone, Error)]
#[error("could not acquire audio input device: {reason}")]
pub struct DeviceAcquisitionError {
    pub reason: String,
}

impl DeviceAcquisitionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    DeviceAcquisition(#[from] DeviceAcquisitionError),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}
