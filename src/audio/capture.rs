//! Microphone capture pipeline
//!
//! Device blocks are processed on the audio thread by a [`CaptureGraph`]; full
//! frames and level updates cross to the async side over a bounded channel,
//! where frames are resampled, encoded to PCM16 and published as base64.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{self, INPUT_SAMPLE_RATE};
use super::worklet::{
    CaptureGraph, WorkletMessage, CAPTURE_FRAME_SAMPLES, LEVEL_UPDATE_INTERVAL_MS,
};
use crate::error::DeviceAcquisitionError;
use crate::Result;

/// Callback run on the audio thread for every block of mono input samples
pub type ProcessCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An acquired input device (the stream and its tracks)
pub trait InputDevice: Send + Sync {
    /// Native sample rate of the delivered blocks
    fn sample_rate(&self) -> u32;

    /// Route device blocks into `process`
    fn connect(&self, process: ProcessCallback) -> Result<()>;

    /// Stop routing blocks; the device stays open
    fn disconnect(&self);

    /// Enable or disable the tracks; a disabled track delivers silence
    fn set_enabled(&self, enabled: bool);

    /// Release the device
    fn stop(&self);
}

/// Platform capture backend
///
/// Implementations:
/// - cpal input devices (`device` feature)
/// - in-memory fakes for tests
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open an input device, preferring `preferred_sample_rate` when given
    async fn acquire(
        &self,
        preferred_sample_rate: Option<u32>,
    ) -> std::result::Result<Box<dyn InputDevice>, DeviceAcquisitionError>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Capture pipeline configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of the encoded output frames
    pub target_sample_rate: u32,
    /// Samples per capture frame at the device rate
    pub frame_samples: usize,
    /// Interval between input level updates
    pub level_update_interval_ms: f64,
    /// Capacity of the audio thread -> pipeline channel
    pub channel_capacity: usize,
    /// Capacity of the outward event channel
    pub event_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: INPUT_SAMPLE_RATE,
            frame_samples: CAPTURE_FRAME_SAMPLES,
            level_update_interval_ms: LEVEL_UPDATE_INTERVAL_MS,
            channel_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// Events published by the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Base64 PCM16 frame at the target sample rate
    Data(String),
    /// Input level estimate
    Volume(f32),
    /// Mute state changed
    Mute(bool),
}

struct ActiveCapture {
    device: Arc<dyn InputDevice>,
    forwarder: JoinHandle<()>,
}

pub struct AudioCapturePipeline {
    backend: Arc<dyn CaptureBackend>,
    config: CaptureConfig,
    events: broadcast::Sender<CaptureEvent>,
    /// Held across the whole of start/stop so they serialize
    lifecycle: tokio::sync::Mutex<Option<ActiveCapture>>,
    /// Mirror of the active device for synchronous mute toggling
    device: Mutex<Option<Arc<dyn InputDevice>>>,
    muted: AtomicBool,
}

impl AudioCapturePipeline {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: CaptureConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            backend,
            config,
            events,
            lifecycle: tokio::sync::Mutex::new(None),
            device: Mutex::new(None),
            muted: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.config.target_sample_rate
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.current_device().is_some()
    }

    /// Start capturing
    ///
    /// A call made while another start is in flight waits for it and then
    /// returns without opening a second device.
    pub async fn start(&self) -> Result<()> {
        let mut active = self.lifecycle.lock().await;
        if active.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        info!("Starting audio capture via {}", self.backend.name());

        let device: Arc<dyn InputDevice> = Arc::from(self.acquire_device().await?);

        let sample_rate = device.sample_rate();
        if sample_rate == 0 {
            device.stop();
            return Err(DeviceAcquisitionError::new("could not get sample rate from input device").into());
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut graph = CaptureGraph::new(sample_rate, self.config.frame_samples);
        graph.set_level_interval_ms(self.config.level_update_interval_ms);

        // Runs on the audio thread: blocking here is the backpressure policy
        let process: ProcessCallback = Box::new(move |input: &[f32]| {
            graph.process(input, &mut |message| {
                let _ = tx.blocking_send(message);
            });
        });

        if let Err(e) = device.connect(process) {
            device.stop();
            return Err(e);
        }
        device.set_enabled(!self.is_muted());

        let forwarder = tokio::spawn(forward_worklet_messages(
            rx,
            self.events.clone(),
            sample_rate,
            self.config.target_sample_rate,
        ));

        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&device));
        *active = Some(ActiveCapture { device, forwarder });

        info!(
            "Audio capture started ({}Hz device -> {}Hz frames)",
            sample_rate, self.config.target_sample_rate
        );

        Ok(())
    }

    async fn acquire_device(&self) -> Result<Box<dyn InputDevice>> {
        match self
            .backend
            .acquire(Some(self.config.target_sample_rate))
            .await
        {
            Ok(device) => Ok(device),
            Err(e) => {
                warn!(
                    "Could not get audio with ideal sample rate, trying without constraint: {}",
                    e
                );
                Ok(self.backend.acquire(None).await?)
            }
        }
    }

    /// Stop capturing and release the device
    ///
    /// Waits for an in-flight start so its device is not leaked. Safe to call
    /// repeatedly.
    pub async fn stop(&self) {
        let mut active = self.lifecycle.lock().await;
        let Some(capture) = active.take() else {
            return;
        };

        self.device.lock().unwrap_or_else(|e| e.into_inner()).take();

        capture.device.disconnect();
        capture.device.stop();
        capture.forwarder.abort();

        info!("Audio capture stopped");
    }

    /// Flip the mute state of the active tracks without touching the device
    ///
    /// Does nothing when no device is open. Returns the resulting mute state.
    pub fn toggle_mute(&self) -> bool {
        let Some(device) = self.current_device() else {
            return self.is_muted();
        };

        let muted = !self.muted.fetch_xor(true, Ordering::SeqCst);
        device.set_enabled(!muted);
        let _ = self.events.send(CaptureEvent::Mute(muted));

        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    fn current_device(&self) -> Option<Arc<dyn InputDevice>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

async fn forward_worklet_messages(
    mut rx: mpsc::Receiver<WorkletMessage>,
    events: broadcast::Sender<CaptureEvent>,
    source_rate: u32,
    target_rate: u32,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkletMessage::Chunk(samples) => {
                if samples.is_empty() {
                    continue;
                }
                let encoded = codec::encode_frame(source_rate, target_rate, &samples);
                let _ = events.send(CaptureEvent::Data(encoded));
            }
            WorkletMessage::Level(volume) => {
                let _ = events.send(CaptureEvent::Volume(volume));
            }
        }
    }

    debug!("Capture forwarder finished");
}
