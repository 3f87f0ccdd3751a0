use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{
    AudioCapturePipeline, CaptureEvent, ContextRegistry, DeviceRegistry, OutputContext,
    OutputDevice, OutputDeviceSet, PlaybackConfig, PlaybackScheduler,
};
use crate::session::{ConnectionState, LiveConfig, MediaChunk, SessionClient, SessionEvent};
use crate::{Error, Result};

/// Registry id of the model audio output context
pub const OUTPUT_CONTEXT_ID: &str = "audio-out";

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub playback: PlaybackConfig,
    /// Weight of a new level reading in the smoothed volume
    pub volume_smoothing: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            playback: PlaybackConfig::default(),
            volume_smoothing: 0.3,
        }
    }
}

/// Which local sources to stream to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    #[serde(default = "default_mic")]
    pub mic: bool,
}

fn default_mic() -> bool {
    true
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self { mic: true }
    }
}

/// Exponentially smoothed level, stored as f32 bits
struct SmoothedLevel {
    bits: AtomicU32,
    smoothing: f32,
}

impl SmoothedLevel {
    fn new(smoothing: f32) -> Self {
        Self {
            bits: AtomicU32::new(0f32.to_bits()),
            smoothing: smoothing.clamp(0.0, 1.0),
        }
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::SeqCst))
    }

    fn store(&self, level: f32) {
        self.bits.store(level.to_bits(), Ordering::SeqCst);
    }

    /// Fold a reading in; an exact zero means silence and resets the level
    fn update(&self, level: f32) {
        if level <= 0.0 {
            self.store(0.0);
            return;
        }
        let current = self.load();
        let smoothed = current + self.smoothing * (level - current);
        self.store(smoothed.clamp(0.0, 1.0));
    }
}

struct VoiceShared {
    client: SessionClient,
    capture: AudioCapturePipeline,
    playback: PlaybackScheduler,
    devices: Option<Arc<dyn DeviceRegistry>>,
    output_devices: Mutex<OutputDeviceSet>,
    speaking: Arc<AtomicBool>,
    /// Level of the model audio being played
    volume: Arc<SmoothedLevel>,
    /// Level of the microphone
    input_volume: SmoothedLevel,
    active: AtomicBool,
}

/// Binds capture, the session client and playback into one voice call
///
/// Microphone frames become realtime inputs, model audio is queued for
/// playback, and interruptions or a closed session hard-stop playback. The
/// exposed volume follows the played model audio.
pub struct VoiceSession {
    shared: Arc<VoiceShared>,
    contexts: Arc<ContextRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    /// Wire the components together and start the event pumps
    ///
    /// The output context is taken from `contexts` under [`OUTPUT_CONTEXT_ID`],
    /// created with `create_output` on first use. Must be called inside a
    /// Tokio runtime.
    pub fn new<F>(
        client: SessionClient,
        capture: AudioCapturePipeline,
        contexts: Arc<ContextRegistry>,
        create_output: F,
        devices: Option<Arc<dyn DeviceRegistry>>,
        config: VoiceConfig,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<dyn OutputContext>>,
    {
        let output = contexts.get_or_create(OUTPUT_CONTEXT_ID, create_output)?;
        let playback = PlaybackScheduler::new(output, config.playback.clone());

        let speaking = Arc::new(AtomicBool::new(false));
        let drained = Arc::clone(&speaking);
        playback.set_on_complete(move || {
            drained.store(false, Ordering::SeqCst);
        });

        let volume = Arc::new(SmoothedLevel::new(config.volume_smoothing));
        let output_level = Arc::clone(&volume);
        playback.set_on_level(move |level| output_level.update(level));

        let client_events = client.subscribe();
        let capture_events = capture.subscribe();

        let shared = Arc::new(VoiceShared {
            client,
            capture,
            playback,
            devices,
            output_devices: Mutex::new(OutputDeviceSet::default()),
            speaking,
            volume,
            input_volume: SmoothedLevel::new(config.volume_smoothing),
            active: AtomicBool::new(false),
        });

        let mut tasks = vec![
            tokio::spawn(pump_session_events(Arc::clone(&shared), client_events)),
            tokio::spawn(pump_capture_events(Arc::clone(&shared), capture_events)),
        ];

        if let Some(registry) = shared.devices.clone() {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.on_device_change(tx);
            tasks.push(tokio::spawn(pump_device_changes(Arc::clone(&shared), rx)));

            if let Err(e) = shared.refresh_output_devices() {
                warn!("Error enumerating output devices: {}", e);
            }
        }

        Ok(Self {
            shared,
            contexts,
            tasks,
        })
    }

    pub fn client(&self) -> &SessionClient {
        &self.shared.client
    }

    pub fn capture(&self) -> &AudioCapturePipeline {
        &self.shared.capture
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.shared.playback
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    /// Connect to `model`, replacing any stale session
    ///
    /// Returns `false` when a session is already connected or connecting.
    pub async fn connect(&self, model: &str, config: LiveConfig) -> bool {
        let client = &self.shared.client;
        if matches!(
            client.status(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return false;
        }

        client.disconnect().await;

        if let Err(e) = self.shared.playback.resume() {
            warn!("Failed to resume output context: {}", e);
        }

        client.connect(model, config).await
    }

    pub async fn disconnect(&self) -> bool {
        self.shared.playback.stop();
        self.shared.speaking.store(false, Ordering::SeqCst);
        self.shared.client.disconnect().await
    }

    /// Start streaming local input to the session
    pub async fn start(&self, options: CaptureOptions) -> Result<()> {
        if options.mic {
            self.shared.capture.start().await?;
        }
        self.shared.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop(&self) {
        self.shared.capture.stop().await;
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.input_volume.store(0.0);
    }

    pub fn toggle_mute(&self) -> bool {
        self.shared.capture.toggle_mute()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.capture.is_muted()
    }

    /// Whether local input streaming was started
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> bool {
        self.shared.client.status() == ConnectionState::Connected
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    /// Smoothed level of the model audio being played, in `[0, 1]`
    pub fn volume(&self) -> f32 {
        self.shared.volume.load()
    }

    /// Smoothed microphone level in `[0, 1]`
    pub fn input_volume(&self) -> f32 {
        self.shared.input_volume.load()
    }

    pub fn send_text(&self, text: &str) {
        self.shared.client.send_text(text);
    }

    pub fn output_devices(&self) -> Vec<OutputDevice> {
        self.shared.output_devices().devices().to_vec()
    }

    pub fn active_output_device(&self) -> Option<OutputDevice> {
        self.shared.output_devices().active().cloned()
    }

    /// Route model audio to another output device
    pub fn set_audio_output(&self, device_id: &str) -> Result<()> {
        if self.shared.output_devices().find(device_id).is_none() {
            return Err(Error::Device(format!("unknown output device: {}", device_id)));
        }

        self.shared.playback.context().set_sink(device_id)?;
        self.shared.output_devices().set_active(device_id);

        info!("Audio output switched to {}", device_id);
        Ok(())
    }

    pub fn refresh_output_devices(&self) -> Result<()> {
        self.shared.refresh_output_devices()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl VoiceShared {
    fn output_devices(&self) -> MutexGuard<'_, OutputDeviceSet> {
        self.output_devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_output_devices(&self) -> Result<()> {
        let Some(registry) = &self.devices else {
            return Ok(());
        };

        let devices = registry.enumerate_output_devices()?;
        debug!("Found {} output devices", devices.len());
        self.output_devices().refresh(devices);
        Ok(())
    }
}

async fn pump_session_events(
    shared: Arc<VoiceShared>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Session event pump lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SessionEvent::Audio(bytes) => {
                shared.speaking.store(true, Ordering::SeqCst);
                shared.playback.add_pcm16(&bytes);
            }
            SessionEvent::Interrupted => {
                shared.playback.stop();
                shared.speaking.store(false, Ordering::SeqCst);
            }
            SessionEvent::TurnComplete => {
                shared.playback.complete();
                shared.speaking.store(false, Ordering::SeqCst);
            }
            SessionEvent::Error(e) => {
                debug!("Session error: {}", e.message);
                shared.speaking.store(false, Ordering::SeqCst);
            }
            SessionEvent::Close(info) => {
                debug!("Session closed with code {}, stopping audio", info.code);
                shared.playback.stop();
                shared.speaking.store(false, Ordering::SeqCst);
                shared.capture.stop().await;
                shared.active.store(false, Ordering::SeqCst);
                shared.volume.store(0.0);
                shared.input_volume.store(0.0);
            }
            _ => {}
        }
    }
}

async fn pump_capture_events(
    shared: Arc<VoiceShared>,
    mut events: broadcast::Receiver<CaptureEvent>,
) {
    let sample_rate = shared.capture.target_sample_rate();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Capture event pump lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            CaptureEvent::Data(data) => {
                shared
                    .client
                    .send_realtime_input(&[MediaChunk::pcm(sample_rate, data)]);
            }
            CaptureEvent::Volume(level) => shared.input_volume.update(level),
            CaptureEvent::Mute(muted) => debug!("Capture mute changed: {}", muted),
        }
    }
}

async fn pump_device_changes(shared: Arc<VoiceShared>, mut changes: mpsc::UnboundedReceiver<()>) {
    while changes.recv().await.is_some() {
        if let Err(e) = shared.refresh_output_devices() {
            warn!("Error enumerating output devices: {}", e);
        }
    }
}
