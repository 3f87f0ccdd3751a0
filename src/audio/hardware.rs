//! cpal-backed audio hardware
//!
//! cpal streams are not `Send`, so every stream lives on its own thread and
//! is driven through channels. Devices are identified by their cpal name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, SupportedStreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::capture::{CaptureBackend, InputDevice, ProcessCallback};
use super::codec;
use super::device::{DeviceRegistry, OutputDevice};
use super::playback::{GainId, OutputContext, ScheduledSource};
use crate::error::DeviceAcquisitionError;
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn find_output_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    let devices = host
        .output_devices()
        .map_err(|e| Error::Device(format!("enumerate output devices: {}", e)))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(Error::Device(format!("unknown output device: {}", name)))
}

// ============================================================================
// Capture
// ============================================================================

/// Default cpal input device
#[derive(Debug, Default)]
pub struct CpalCaptureBackend;

impl CpalCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CaptureBackend for CpalCaptureBackend {
    async fn acquire(
        &self,
        preferred_sample_rate: Option<u32>,
    ) -> std::result::Result<Box<dyn InputDevice>, DeviceAcquisitionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let route: Arc<Mutex<Option<ProcessCallback>>> = Arc::new(Mutex::new(None));
        let enabled = Arc::new(AtomicBool::new(true));

        let sink = InputSink {
            route: Arc::clone(&route),
            enabled: Arc::clone(&enabled),
            channels: 1,
        };

        thread::Builder::new()
            .name("cpal-input".to_string())
            .spawn(move || {
                let stream = match open_input_stream(preferred_sample_rate, sink) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Block until stopped or the device handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Input stream released");
            })
            .map_err(|e| DeviceAcquisitionError::new(format!("spawn input thread: {}", e)))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| DeviceAcquisitionError::new("input thread exited"))??;

        Ok(Box::new(CpalInputDevice {
            sample_rate,
            route,
            enabled,
            stop: Mutex::new(Some(stop_tx)),
        }))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

/// Audio-thread side of an input stream: downmix, gate, route
struct InputSink {
    route: Arc<Mutex<Option<ProcessCallback>>>,
    enabled: Arc<AtomicBool>,
    channels: usize,
}

impl InputSink {
    fn push(&self, interleaved: &[f32]) {
        let channels = self.channels.max(1);
        let mut mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        if !self.enabled.load(Ordering::Relaxed) {
            mono.iter_mut().for_each(|s| *s = 0.0);
        }

        if let Some(process) = lock(&self.route).as_mut() {
            process(&mono);
        }
    }
}

fn input_config(
    device: &cpal::Device,
    preferred_sample_rate: Option<u32>,
) -> std::result::Result<SupportedStreamConfig, DeviceAcquisitionError> {
    let Some(rate) = preferred_sample_rate else {
        return device
            .default_input_config()
            .map_err(|e| DeviceAcquisitionError::new(format!("default input config: {}", e)));
    };

    let ranges = device
        .supported_input_configs()
        .map_err(|e| DeviceAcquisitionError::new(format!("input configs: {}", e)))?;

    ranges
        .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .find(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .map(|r| r.with_sample_rate(SampleRate(rate)))
        .ok_or_else(|| DeviceAcquisitionError::new(format!("{}Hz input not supported", rate)))
}

fn open_input_stream(
    preferred_sample_rate: Option<u32>,
    mut sink: InputSink,
) -> std::result::Result<(Stream, u32), DeviceAcquisitionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceAcquisitionError::new("no input device available"))?;

    let supported = input_config(&device, preferred_sample_rate)?;
    let sample_rate = supported.sample_rate().0;
    let config = supported.config();
    sink.channels = usize::from(config.channels);

    info!(
        "Opening input device {} ({}Hz, {} channels, {:?})",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        config.channels,
        supported.sample_format()
    );

    let err_fn = |e| error!("Input stream error: {}", e);
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| sink.push(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| f32::from(*s) / 32768.0).collect();
                sink.push(&samples);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(DeviceAcquisitionError::new(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| DeviceAcquisitionError::new(format!("build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| DeviceAcquisitionError::new(format!("start input stream: {}", e)))?;

    Ok((stream, sample_rate))
}

struct CpalInputDevice {
    sample_rate: u32,
    route: Arc<Mutex<Option<ProcessCallback>>>,
    enabled: Arc<AtomicBool>,
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl InputDevice for CpalInputDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&self, process: ProcessCallback) -> Result<()> {
        *lock(&self.route) = Some(process);
        Ok(())
    }

    fn disconnect(&self) {
        lock(&self.route).take();
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: f32,
    to: f32,
    start: f64,
    end: f64,
}

#[derive(Debug, Clone, Copy)]
struct GainStage {
    value: f32,
    ramp: Option<Ramp>,
}

impl GainStage {
    fn value_at(&self, time: f64) -> f32 {
        match self.ramp {
            Some(ramp) if time >= ramp.end => ramp.to,
            Some(ramp) if time > ramp.start => {
                let progress = (time - ramp.start) / (ramp.end - ramp.start);
                ramp.from + (ramp.to - ramp.from) * progress as f32
            }
            Some(ramp) => ramp.from,
            None => self.value,
        }
    }
}

struct ActiveSource {
    samples: Vec<f32>,
    start_frame: u64,
    position: usize,
    gain: GainId,
}

/// Render graph shared with the output callback
///
/// Runs at the device rate. Sources are resampled on arrival.
struct Mixer {
    sample_rate: u32,
    /// Context time of frame zero at the current rate
    origin: f64,
    frames_rendered: u64,
    gains: HashMap<GainId, GainStage>,
    next_gain: GainId,
    sources: Vec<ActiveSource>,
}

impl Mixer {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            origin: 0.0,
            frames_rendered: 0,
            gains: HashMap::new(),
            next_gain: 0,
            sources: Vec::new(),
        }
    }

    fn time(&self) -> f64 {
        self.origin + self.frames_rendered as f64 / f64::from(self.sample_rate)
    }

    fn frame_at(&self, time: f64) -> u64 {
        ((time - self.origin).max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    fn add_source(&mut self, source: ScheduledSource) {
        let samples = codec::resample(source.sample_rate, self.sample_rate, &source.samples);
        let start_frame = self.frame_at(source.start_at).max(self.frames_rendered);

        self.sources.push(ActiveSource {
            samples,
            start_frame,
            position: 0,
            gain: source.gain,
        });
    }

    /// Switch to a new device rate; the clock and pending audio carry over
    fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == 0 || sample_rate == self.sample_rate {
            return;
        }

        let now = self.time();
        let origin = self.origin;
        let old_rate = self.sample_rate;
        for source in &mut self.sources {
            let start_at = origin + source.start_frame as f64 / f64::from(old_rate);
            source.samples =
                codec::resample(old_rate, sample_rate, &source.samples[source.position..]);
            source.position = 0;
            source.start_frame = ((start_at - now).max(0.0) * f64::from(sample_rate)).round() as u64;
        }

        debug!("Mixer rate {}Hz -> {}Hz", old_rate, sample_rate);
        self.sample_rate = sample_rate;
        self.origin = now;
        self.frames_rendered = 0;
    }

    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let rate = f64::from(self.sample_rate);

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let frame_index = self.frames_rendered + i as u64;
            let time = self.origin + frame_index as f64 / rate;
            let mut mixed = 0.0f32;

            for source in &mut self.sources {
                if frame_index < source.start_frame || source.position >= source.samples.len() {
                    continue;
                }
                let gain = self
                    .gains
                    .get(&source.gain)
                    .map(|g| g.value_at(time))
                    .unwrap_or(0.0);
                mixed += source.samples[source.position] * gain;
                source.position += 1;
            }

            frame.iter_mut().for_each(|s| *s = mixed.clamp(-1.0, 1.0));
        }

        self.frames_rendered += (out.len() / channels) as u64;
        self.sources.retain(|s| s.position < s.samples.len());

        let now = self.time();
        for stage in self.gains.values_mut() {
            if let Some(ramp) = stage.ramp {
                if now >= ramp.end {
                    stage.value = ramp.to;
                    stage.ramp = None;
                }
            }
        }
    }
}

enum StreamCommand {
    Retarget(String, std_mpsc::Sender<Result<()>>),
    Play(std_mpsc::Sender<Result<()>>),
}

/// Output context rendering scheduled sources through gain stages
///
/// The mixer renders at whatever rate the device runs; sources at other
/// rates are resampled. Re-targeting the sink rebuilds only the cpal stream;
/// the render graph, clock and queued sources carry over.
pub struct CpalOutputContext {
    mixer: Arc<Mutex<Mixer>>,
    suspended: Arc<AtomicBool>,
    commands: Mutex<std_mpsc::Sender<StreamCommand>>,
}

impl CpalOutputContext {
    /// Open the named output device, or the default one
    ///
    /// `preferred_rate` is used when the device supports it, otherwise the
    /// device's default rate.
    pub fn new(device_name: Option<&str>, preferred_rate: u32) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::new(preferred_rate)));
        let suspended = Arc::new(AtomicBool::new(true));

        let (command_tx, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread_mixer = Arc::clone(&mixer);
        let thread_suspended = Arc::clone(&suspended);
        let initial = device_name.map(str::to_string);

        thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                run_output_thread(
                    initial,
                    preferred_rate,
                    thread_mixer,
                    thread_suspended,
                    command_rx,
                    ready_tx,
                )
            })
            .map_err(|e| Error::Device(format!("spawn output thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("output thread exited".to_string()))??;

        Ok(Self {
            mixer,
            suspended,
            commands: Mutex::new(command_tx),
        })
    }

    fn request(&self, command: impl FnOnce(std_mpsc::Sender<Result<()>>) -> StreamCommand) -> Result<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        lock(&self.commands)
            .send(command(reply_tx))
            .map_err(|_| Error::Device("output thread stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Device("output thread stopped".to_string()))?
    }
}

impl OutputContext for CpalOutputContext {
    fn current_time(&self) -> f64 {
        lock(&self.mixer).time()
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn resume(&self) -> Result<()> {
        self.request(StreamCommand::Play)
    }

    fn create_gain(&self) -> GainId {
        let mut mixer = lock(&self.mixer);
        let id = mixer.next_gain;
        mixer.next_gain += 1;
        mixer.gains.insert(
            id,
            GainStage {
                value: 1.0,
                ramp: None,
            },
        );
        id
    }

    fn set_gain(&self, gain: GainId, value: f32, _at: f64) {
        if let Some(stage) = lock(&self.mixer).gains.get_mut(&gain) {
            stage.value = value;
            stage.ramp = None;
        }
    }

    fn ramp_gain(&self, gain: GainId, value: f32, end_time: f64) {
        let mut mixer = lock(&self.mixer);
        let now = mixer.time();
        if let Some(stage) = mixer.gains.get_mut(&gain) {
            let from = stage.value_at(now);
            stage.value = from;
            stage.ramp = Some(Ramp {
                from,
                to: value,
                start: now,
                end: end_time.max(now),
            });
        }
    }

    fn disconnect_gain(&self, gain: GainId) {
        let mut mixer = lock(&self.mixer);
        mixer.gains.remove(&gain);
        mixer.sources.retain(|s| s.gain != gain);
    }

    fn start_source(&self, source: ScheduledSource) {
        lock(&self.mixer).add_source(source);
    }

    fn set_sink(&self, device_id: &str) -> Result<()> {
        let name = device_id.to_string();
        self.request(|reply| StreamCommand::Retarget(name, reply))
    }
}

fn output_config(device: &cpal::Device, preferred_rate: u32) -> Result<SupportedStreamConfig> {
    let preferred = device
        .supported_output_configs()
        .ok()
        .and_then(|mut ranges| {
            ranges.find(|r| {
                matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16)
                    && r.min_sample_rate().0 <= preferred_rate
                    && preferred_rate <= r.max_sample_rate().0
            })
        })
        .map(|r| r.with_sample_rate(SampleRate(preferred_rate)));

    if let Some(config) = preferred {
        return Ok(config);
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::Device(format!("default output config: {}", e)))?;
    debug!(
        "{}Hz output not supported, using device rate {}Hz",
        preferred_rate,
        fallback.sample_rate().0
    );
    Ok(fallback)
}

/// Open an output stream and move the mixer to the device rate
fn build_output_stream(
    host: &cpal::Host,
    device_name: Option<&str>,
    preferred_rate: u32,
    mixer: &Arc<Mutex<Mixer>>,
) -> Result<Stream> {
    let device = match device_name {
        Some(name) => find_output_device(host, name)?,
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Device("no output device available".to_string()))?,
    };

    let supported = output_config(&device, preferred_rate)?;
    let sample_rate = supported.sample_rate().0;
    let config = supported.config();
    let channels = usize::from(config.channels);

    info!(
        "Opening output device {} ({}Hz, {} channels, {:?})",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels,
        supported.sample_format()
    );

    lock(mixer).set_sample_rate(sample_rate);
    let render_mixer = Arc::clone(mixer);
    let err_fn = |e| error!("Output stream error: {}", e);

    match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                lock(&render_mixer).render(data, channels);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0f32);
                    lock(&render_mixer).render(&mut scratch, channels);
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = codec::float_to_i16(*sample);
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::Device(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| Error::Device(format!("build output stream: {}", e)))
}

fn run_output_thread(
    device_name: Option<String>,
    preferred_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    suspended: Arc<AtomicBool>,
    commands: std_mpsc::Receiver<StreamCommand>,
    ready: std_mpsc::Sender<Result<()>>,
) {
    let host = cpal::default_host();
    let mut stream = match build_output_stream(&host, device_name.as_deref(), preferred_rate, &mixer)
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    match stream.play() {
        Ok(()) => suspended.store(false, Ordering::SeqCst),
        Err(e) => warn!("Output stream did not start, context suspended: {}", e),
    }
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| Error::Device(format!("resume output: {}", e)));
                if result.is_ok() {
                    suspended.store(false, Ordering::SeqCst);
                }
                let _ = reply.send(result);
            }
            StreamCommand::Retarget(name, reply) => {
                let previous_rate = lock(&mixer).sample_rate;
                let result = build_output_stream(&host, Some(&name), preferred_rate, &mixer)
                    .and_then(|next| {
                        next.play()
                            .map_err(|e| Error::Device(format!("start output: {}", e)))?;
                        Ok(next)
                    });

                match result {
                    Ok(next) => {
                        stream = next;
                        suspended.store(false, Ordering::SeqCst);
                        info!("Output re-targeted to {}", name);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        // The old stream keeps playing at its own rate
                        lock(&mixer).set_sample_rate(previous_rate);
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    debug!("Output context closed");
}

// ============================================================================
// Device registry
// ============================================================================

/// Output devices of the default host, polled for changes
#[derive(Debug, Clone)]
pub struct CpalDeviceRegistry {
    poll_interval: Duration,
}

impl CpalDeviceRegistry {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for CpalDeviceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

fn output_device_list(host: &cpal::Host) -> Result<Vec<OutputDevice>> {
    let devices = host
        .output_devices()
        .map_err(|e| Error::Device(format!("enumerate output devices: {}", e)))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| OutputDevice {
            device_id: name.clone(),
            label: name,
        })
        .collect())
}

impl DeviceRegistry for CpalDeviceRegistry {
    fn enumerate_output_devices(&self) -> Result<Vec<OutputDevice>> {
        output_device_list(&cpal::default_host())
    }

    fn on_device_change(&self, notify: mpsc::UnboundedSender<()>) {
        let interval = self.poll_interval;
        let spawned = thread::Builder::new()
            .name("cpal-devices".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let mut last = output_device_list(&host).unwrap_or_default();

                loop {
                    thread::sleep(interval);
                    if notify.is_closed() {
                        return;
                    }

                    let current = output_device_list(&host).unwrap_or_default();
                    if current != last {
                        last = current;
                        if notify.send(()).is_err() {
                            return;
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            warn!("Device change polling unavailable: {}", e);
        }
    }
}
