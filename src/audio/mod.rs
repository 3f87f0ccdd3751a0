pub mod capture;
pub mod codec;
pub mod context;
pub mod device;
pub mod playback;
pub mod worklet;

#[cfg(feature = "device")]
pub mod hardware;

pub use capture::{
    AudioCapturePipeline, CaptureBackend, CaptureConfig, CaptureEvent, InputDevice,
    ProcessCallback,
};
pub use context::ContextRegistry;
pub use device::{DeviceRegistry, OutputDevice, OutputDeviceSet};
pub use playback::{
    GainId, OutputContext, PlaybackConfig, PlaybackScheduler, PlaybackStats, ScheduledSource,
    SourceId,
};
pub use worklet::{CaptureGraph, CaptureWorklet, LevelMeterWorklet, WorkletMessage};
