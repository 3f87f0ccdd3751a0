// Shared fakes for the integration tests
//
// Each fake stands in for one platform or network seam and records what the
// engine did to it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use live_voice::audio::{
    CaptureBackend, DeviceRegistry, GainId, InputDevice, OutputContext, OutputDevice,
    ProcessCallback, ScheduledSource,
};
use live_voice::session::{
    CloseInfo, DiagnosticsSink, ErrorReport, InteractionStore, LiveConfig, RealtimeInput,
    SaveInteractionPayload, Transport, TransportEvent, TransportEvents, TransportHandle,
};
use live_voice::{DeviceAcquisitionError, Error, Result};
use tokio::sync::mpsc;

/// Let spawned tasks run on the current-thread test runtime
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One connection opened through [`FakeTransport`]
pub struct FakeConnection {
    pub model: String,
    pub config: LiveConfig,
    events: TransportEvents,
    pub sent: Mutex<Vec<RealtimeInput>>,
    pub closed: AtomicBool,
    ack_close: bool,
}

impl FakeConnection {
    /// Deliver a server message
    pub fn server(&self, message: serde_json::Value) {
        self.raw(message.to_string().into_bytes());
    }

    pub fn raw(&self, payload: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Message(payload));
    }

    pub fn server_close(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Close(CloseInfo {
            code,
            reason: reason.to_string(),
            was_clean: code == 1000,
        }));
    }

    pub fn server_error(&self, message: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error(live_voice::session::TransportError::new(message)));
    }

    pub fn sent(&self) -> Vec<RealtimeInput> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeHandle(Arc<FakeConnection>);

impl TransportHandle for FakeHandle {
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()> {
        self.0.sent.lock().unwrap().push(input);
        Ok(())
    }

    fn close(&self) {
        if !self.0.closed.swap(true, Ordering::SeqCst) && self.0.ack_close {
            let _ = self
                .0
                .events
                .send(TransportEvent::Close(CloseInfo::normal("Client closed")));
        }
    }
}

pub struct FakeTransport {
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    /// Fail every connect attempt
    pub fail: AtomicBool,
    /// Acknowledge client closes with a close event
    pub ack_close: AtomicBool,
    /// Time taken to open a connection
    pub open_delay: Mutex<Duration>,
    /// Per-attempt outcomes in call order (`true` fails); `fail` applies once empty
    pub script: Mutex<VecDeque<bool>>,
    /// Time between the open event and the handle being returned
    pub handle_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            ack_close: AtomicBool::new(true),
            open_delay: Mutex::new(Duration::ZERO),
            script: Mutex::new(VecDeque::new()),
            handle_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeConnection> {
        Arc::clone(self.connections.lock().unwrap().last().unwrap())
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        model: &str,
        config: &LiveConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>> {
        let scripted = self.script.lock().unwrap().pop_front();
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if scripted.unwrap_or_else(|| self.fail.load(Ordering::SeqCst)) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let connection = Arc::new(FakeConnection {
            model: model.to_string(),
            config: config.clone(),
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            ack_close: self.ack_close.load(Ordering::SeqCst),
        });
        let _ = connection.events.send(TransportEvent::Open);
        self.connections.lock().unwrap().push(Arc::clone(&connection));

        let delay = *self.handle_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(Box::new(FakeHandle(connection)))
    }
}

// ============================================================================
// Persistence and diagnostics
// ============================================================================

pub struct FakeStore {
    saved: mpsc::UnboundedSender<SaveInteractionPayload>,
    pub fail: AtomicBool,
    /// Time each save takes, in call order
    pub delays: Mutex<VecDeque<Duration>>,
}

impl FakeStore {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SaveInteractionPayload>) {
        let (saved, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                saved,
                fail: AtomicBool::new(false),
                delays: Mutex::new(VecDeque::new()),
            }),
            rx,
        )
    }
}

#[async_trait::async_trait]
impl InteractionStore for FakeStore {
    async fn save_interaction(&self, payload: &SaveInteractionPayload) -> Result<()> {
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Persistence("store unavailable".to_string()));
        }
        let _ = self.saved.send(payload.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDiagnostics {
    pub reports: Mutex<Vec<ErrorReport>>,
}

impl FakeDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

impl DiagnosticsSink for FakeDiagnostics {
    fn report_error(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

// ============================================================================
// Audio output
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GainEvent {
    Created(GainId),
    Set(GainId, f32),
    Ramp(GainId, f32),
    Disconnected(GainId),
}

/// Output context on the Tokio clock, so paused tests control time
pub struct FakeOutput {
    origin: tokio::time::Instant,
    next_gain: AtomicU64,
    pub sources: Mutex<Vec<ScheduledSource>>,
    pub gains: Mutex<Vec<GainEvent>>,
    pub sinks: Mutex<Vec<String>>,
    pub suspended: AtomicBool,
    pub resumes: AtomicUsize,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            next_gain: AtomicU64::new(0),
            sources: Mutex::new(Vec::new()),
            gains: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            resumes: AtomicUsize::new(0),
        })
    }

    pub fn sources(&self) -> Vec<ScheduledSource> {
        self.sources.lock().unwrap().clone()
    }

    pub fn scheduled_samples(&self) -> usize {
        self.sources.lock().unwrap().iter().map(|s| s.samples.len()).sum()
    }

    pub fn gain_events(&self) -> Vec<GainEvent> {
        self.gains.lock().unwrap().clone()
    }
}

impl OutputContext for FakeOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn resume(&self) -> Result<()> {
        self.suspended.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_gain(&self) -> GainId {
        let id = self.next_gain.fetch_add(1, Ordering::SeqCst);
        self.gains.lock().unwrap().push(GainEvent::Created(id));
        id
    }

    fn set_gain(&self, gain: GainId, value: f32, _at: f64) {
        self.gains.lock().unwrap().push(GainEvent::Set(gain, value));
    }

    fn ramp_gain(&self, gain: GainId, value: f32, _end_time: f64) {
        self.gains.lock().unwrap().push(GainEvent::Ramp(gain, value));
    }

    fn disconnect_gain(&self, gain: GainId) {
        self.gains.lock().unwrap().push(GainEvent::Disconnected(gain));
    }

    fn start_source(&self, source: ScheduledSource) {
        self.sources.lock().unwrap().push(source);
    }

    fn set_sink(&self, device_id: &str) -> Result<()> {
        self.sinks.lock().unwrap().push(device_id.to_string());
        Ok(())
    }
}

/// Little-endian PCM16 bytes counting up from `start`
pub fn pcm16_ramp(start: i16, samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| start.wrapping_add(i as i16).to_le_bytes())
        .collect()
}

/// Little-endian PCM16 bytes of a constant `amplitude`
pub fn pcm16_tone(amplitude: i16, samples: usize) -> Vec<u8> {
    (0..samples).flat_map(|_| amplitude.to_le_bytes()).collect()
}

// ============================================================================
// Audio input
// ============================================================================

/// Shared view of an input device handed out by [`FakeCaptureBackend`]
pub struct FakeInputState {
    pub sample_rate: u32,
    process: Mutex<Option<ProcessCallback>>,
    pub enabled: AtomicBool,
    pub stop_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
}

impl FakeInputState {
    /// Push one block through the connected callback from a plain thread,
    /// the way an audio thread would
    pub fn feed(self: &Arc<Self>, samples: Vec<f32>) {
        let state = Arc::clone(self);
        std::thread::spawn(move || {
            let enabled = state.enabled.load(Ordering::SeqCst);
            let block: Vec<f32> = if enabled {
                samples
            } else {
                vec![0.0; samples.len()]
            };
            if let Some(process) = state.process.lock().unwrap().as_mut() {
                process(&block);
            }
        })
        .join()
        .unwrap();
    }

    pub fn is_connected(&self) -> bool {
        self.process.lock().unwrap().is_some()
    }
}

struct FakeInputDevice(Arc<FakeInputState>);

impl InputDevice for FakeInputDevice {
    fn sample_rate(&self) -> u32 {
        self.0.sample_rate
    }

    fn connect(&self, process: ProcessCallback) -> Result<()> {
        *self.0.process.lock().unwrap() = Some(process);
        Ok(())
    }

    fn disconnect(&self) {
        self.0.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.0.process.lock().unwrap().take();
    }

    fn set_enabled(&self, enabled: bool) {
        self.0.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.0.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeCaptureBackend {
    /// Native rate used when the preferred rate is rejected
    pub native_rate: u32,
    pub reject_preferred: bool,
    pub unavailable: bool,
    pub acquire_delay: Duration,
    pub requests: Mutex<Vec<Option<u32>>>,
    pub devices: Mutex<Vec<Arc<FakeInputState>>>,
}

impl FakeCaptureBackend {
    pub fn new(native_rate: u32) -> Self {
        Self {
            native_rate,
            reject_preferred: false,
            unavailable: false,
            acquire_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn last_device(&self) -> Arc<FakeInputState> {
        Arc::clone(self.devices.lock().unwrap().last().unwrap())
    }
}

#[async_trait::async_trait]
impl CaptureBackend for FakeCaptureBackend {
    async fn acquire(
        &self,
        preferred_sample_rate: Option<u32>,
    ) -> std::result::Result<Box<dyn InputDevice>, DeviceAcquisitionError> {
        self.requests.lock().unwrap().push(preferred_sample_rate);

        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }

        if self.unavailable {
            return Err(DeviceAcquisitionError::new("permission denied"));
        }

        let sample_rate = match preferred_sample_rate {
            Some(_) if self.reject_preferred => {
                return Err(DeviceAcquisitionError::new("sample rate not supported"))
            }
            Some(rate) => rate,
            None => self.native_rate,
        };

        let state = Arc::new(FakeInputState {
            sample_rate,
            process: Mutex::new(None),
            enabled: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        });
        self.devices.lock().unwrap().push(Arc::clone(&state));

        Ok(Box::new(FakeInputDevice(state)))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Default)]
pub struct FakeDeviceRegistry {
    pub devices: Mutex<Vec<OutputDevice>>,
    pub listeners: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl FakeDeviceRegistry {
    pub fn with_devices(ids: &[&str]) -> Arc<Self> {
        let registry = Self::default();
        *registry.devices.lock().unwrap() = ids.iter().map(|id| output_device(id)).collect();
        Arc::new(registry)
    }

    /// Replace the device list and notify listeners
    pub fn change(&self, ids: &[&str]) {
        *self.devices.lock().unwrap() = ids.iter().map(|id| output_device(id)).collect();
        for listener in self.listeners.lock().unwrap().iter() {
            let _ = listener.send(());
        }
    }
}

pub fn output_device(id: &str) -> OutputDevice {
    OutputDevice {
        device_id: id.to_string(),
        label: format!("Speaker {}", id),
    }
}

impl DeviceRegistry for FakeDeviceRegistry {
    fn enumerate_output_devices(&self) -> Result<Vec<OutputDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn on_device_change(&self, notify: mpsc::UnboundedSender<()>) {
        self.listeners.lock().unwrap().push(notify);
    }
}
