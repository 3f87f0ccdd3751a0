//! Gapless playback of streamed PCM16 audio
//!
//! Incoming chunks are split into fixed-size float buffers and queued. A
//! scheduling task hands buffers to the [`OutputContext`] slightly ahead of
//! the context clock so consecutive buffers start back to back. A level
//! meter follows the context clock over the scheduled buffers and reports
//! the loudness of what is actually playing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::codec::{self, OUTPUT_SAMPLE_RATE};
use super::worklet::{LevelMeterWorklet, LEVEL_UPDATE_INTERVAL_MS};
use crate::Result;

pub type GainId = u64;
pub type SourceId = u64;

/// Frames per meter block, matching one render quantum
const RENDER_QUANTUM: usize = 128;

/// One buffer handed to the output context for playback
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Context time (seconds) at which playback starts
    pub start_at: f64,
    /// Gain stage the source is routed through
    pub gain: GainId,
}

impl ScheduledSource {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Platform audio output: a monotonic clock plus source and gain nodes
pub trait OutputContext: Send + Sync {
    /// Context clock in seconds
    fn current_time(&self) -> f64;

    fn is_suspended(&self) -> bool;

    fn resume(&self) -> Result<()>;

    /// Create a gain stage connected to the destination at unity gain
    fn create_gain(&self) -> GainId;

    /// Set a gain value effective at context time `at`
    fn set_gain(&self, gain: GainId, value: f32, at: f64);

    /// Ramp a gain linearly to `value`, arriving at context time `end_time`
    fn ramp_gain(&self, gain: GainId, value: f32, end_time: f64);

    /// Disconnect a gain stage and everything routed through it
    fn disconnect_gain(&self, gain: GainId);

    /// Start a source at its scheduled time
    fn start_source(&self, source: ScheduledSource);

    /// Route the context to another output device
    fn set_sink(&self, device_id: &str) -> Result<()>;
}

/// Playback scheduler configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Samples per queued buffer
    pub buffer_size: usize,
    /// Lead-in before the first buffer of a playback cycle (seconds)
    pub initial_buffer_time: f64,
    /// How far ahead of the clock buffers are scheduled (seconds)
    pub schedule_ahead_time: f64,
    /// Wake-up margin before the next scheduling boundary (seconds)
    pub wake_margin: f64,
    /// Poll interval while waiting for new data
    pub idle_poll_interval: Duration,
    /// Gain fade-out on hard stop (seconds)
    pub stop_fade_time: f64,
    /// Delay before the faded gain stage is torn down
    pub gain_rebuild_delay: Duration,
    /// Interval between output level updates
    pub level_update_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            buffer_size: 7680,
            initial_buffer_time: 0.1,
            schedule_ahead_time: 0.2,
            wake_margin: 0.05,
            idle_poll_interval: Duration::from_millis(100),
            stop_fade_time: 0.1,
            gain_rebuild_delay: Duration::from_millis(200),
            level_update_interval: Duration::from_secs_f64(LEVEL_UPDATE_INTERVAL_MS / 1000.0),
        }
    }
}

/// Sample accounting for the current scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub samples_submitted: u64,
    pub samples_scheduled: u64,
    pub samples_discarded: u64,
    pub completions: u64,
}

/// The last scheduled buffer of a drained queue
#[derive(Debug, Clone, Copy)]
struct EndOfQueue {
    source: SourceId,
    ends_at: f64,
}

/// A scheduled buffer the level meter has not fully passed yet
struct MeteredBuffer {
    start_at: f64,
    samples: Vec<f32>,
}

struct State {
    queue: VecDeque<Vec<f32>>,
    is_playing: bool,
    is_stream_complete: bool,
    completion_fired: bool,
    scheduled_time: f64,
    gain: GainId,
    /// Gain stage faded out by the last stop, pending teardown
    faded_gain: Option<GainId>,
    generation: u64,
    next_source_id: SourceId,
    end_of_queue: Option<EndOfQueue>,
    loop_task: Option<JoinHandle<()>>,
    metering: VecDeque<MeteredBuffer>,
    meter: LevelMeterWorklet,
    /// Context time up to which scheduled audio has been metered
    meter_cursor: f64,
    meter_task: Option<JoinHandle<()>>,
    stats: PlaybackStats,
}

type CompletionHook = Arc<dyn Fn() + Send + Sync>;
type LevelHook = Arc<dyn Fn(f32) + Send + Sync>;

struct Shared {
    context: Arc<dyn OutputContext>,
    config: PlaybackConfig,
    state: Mutex<State>,
    on_complete: Mutex<Option<CompletionHook>>,
    on_level: Mutex<Option<LevelHook>>,
}

/// Owns the output queue and the gain stage of one output context
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
}

impl PlaybackScheduler {
    pub fn new(context: Arc<dyn OutputContext>, config: PlaybackConfig) -> Self {
        let gain = context.create_gain();
        let mut meter = LevelMeterWorklet::new(config.sample_rate);
        meter.set_update_interval_ms(config.level_update_interval.as_secs_f64() * 1000.0);
        let state = State {
            queue: VecDeque::new(),
            is_playing: false,
            is_stream_complete: false,
            completion_fired: false,
            scheduled_time: 0.0,
            gain,
            faded_gain: None,
            generation: 0,
            next_source_id: 0,
            end_of_queue: None,
            loop_task: None,
            metering: VecDeque::new(),
            meter,
            meter_cursor: 0.0,
            meter_task: None,
            stats: PlaybackStats::default(),
        };

        Self {
            shared: Arc::new(Shared {
                context,
                config,
                state: Mutex::new(state),
                on_complete: Mutex::new(None),
                on_level: Mutex::new(None),
            }),
        }
    }

    /// Register the callback fired when a playback cycle drains
    pub fn set_on_complete(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .on_complete
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    /// Register the callback receiving the level of the audio being played
    ///
    /// Levels arrive while a playback cycle runs; a final `0.0` is reported
    /// when the output goes idle or is stopped.
    pub fn set_on_level(&self, hook: impl Fn(f32) + Send + Sync + 'static) {
        *self
            .shared
            .on_level
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    pub fn context(&self) -> &Arc<dyn OutputContext> {
        &self.shared.context
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().is_playing
    }

    pub fn queued_buffers(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn scheduled_time(&self) -> f64 {
        self.shared.lock().scheduled_time
    }

    pub fn current_gain(&self) -> GainId {
        self.shared.lock().gain
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.lock().stats
    }

    /// Queue a chunk of little-endian PCM16 audio
    ///
    /// The chunk is split into `buffer_size` buffers; a trailing partial
    /// buffer is queued as is. Starts a playback cycle when idle.
    pub fn add_pcm16(&self, chunk: &[u8]) {
        let samples = codec::decode_pcm16(chunk);
        if samples.is_empty() {
            return;
        }

        let shared = &self.shared;
        let mut state = shared.lock();
        state.is_stream_complete = false;
        state.completion_fired = false;
        state.stats.samples_submitted += samples.len() as u64;

        for buffer in samples.chunks(shared.config.buffer_size.max(1)) {
            state.queue.push_back(buffer.to_vec());
        }

        if !state.is_playing {
            state.is_playing = true;
            if state.faded_gain == Some(state.gain) {
                state.gain = shared.context.create_gain();
            }
            state.scheduled_time =
                shared.context.current_time() + shared.config.initial_buffer_time;

            let generation = state.generation;
            state.loop_task = Some(tokio::spawn(run_schedule_loop(
                Arc::clone(shared),
                generation,
            )));

            if state.meter_task.is_none() {
                state.meter.reset();
                state.meter_cursor = shared.context.current_time();
                state.meter_task = Some(tokio::spawn(run_level_meter(
                    Arc::clone(shared),
                    generation,
                )));
            }

            debug!("Playback cycle started ({} buffers queued)", state.queue.len());
        }
    }

    /// Hard stop: drop everything queued and fade the output out
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.lock();
        let now = shared.context.current_time();

        let discarded: usize = state.queue.iter().map(Vec::len).sum();
        state.stats.samples_discarded += discarded as u64;
        state.queue.clear();
        state.generation += 1;
        state.is_playing = false;
        state.is_stream_complete = true;
        state.scheduled_time = now;
        state.end_of_queue = None;
        if let Some(task) = state.loop_task.take() {
            task.abort();
        }
        if let Some(task) = state.meter_task.take() {
            task.abort();
        }
        state.metering.clear();
        state.meter.reset();

        let faded = state.gain;
        state.faded_gain = Some(faded);
        shared
            .context
            .ramp_gain(faded, 0.0, now + shared.config.stop_fade_time);

        let rebuild = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::time::sleep(rebuild.config.gain_rebuild_delay).await;
            let mut state = rebuild.lock();
            rebuild.context.disconnect_gain(faded);
            if state.gain == faded {
                state.gain = rebuild.context.create_gain();
            }
            if state.faded_gain == Some(faded) {
                state.faded_gain = None;
            }
        });
        drop(state);

        shared.fire_level(0.0);
        info!("Playback stopped ({} queued samples discarded)", discarded);
    }

    /// Re-arm playback after a stop
    pub fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.context.is_suspended() {
            shared.context.resume()?;
        }

        let mut state = shared.lock();
        let now = shared.context.current_time();
        state.is_stream_complete = false;
        state.completion_fired = false;
        state.scheduled_time = now + shared.config.initial_buffer_time;
        if state.faded_gain == Some(state.gain) {
            state.gain = shared.context.create_gain();
        }
        shared.context.set_gain(state.gain, 1.0, now);

        Ok(())
    }

    /// Mark the stream finished; queued audio still plays out
    pub fn complete(&self) {
        let fire = {
            let mut state = self.shared.lock();
            state.is_stream_complete = true;
            let drained = !state.is_playing && state.queue.is_empty();
            if drained && !state.completion_fired {
                state.completion_fired = true;
                state.stats.completions += 1;
                true
            } else {
                false
            }
        };

        if fire {
            self.shared.fire_complete();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire_complete(&self) {
        let hook = self
            .on_complete
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn fire_level(&self, level: f32) {
        let hook = self
            .on_level
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(level);
        }
    }

    /// Hand every buffer that falls inside the look-ahead window to the context
    fn schedule_ready(&self, state: &mut State) {
        let now = self.context.current_time();

        while state.scheduled_time < now + self.config.schedule_ahead_time {
            let Some(samples) = state.queue.pop_front() else {
                break;
            };

            let id = state.next_source_id;
            state.next_source_id += 1;

            let start_at = state.scheduled_time.max(now);
            let source = ScheduledSource {
                id,
                samples,
                sample_rate: self.config.sample_rate,
                start_at,
                gain: state.gain,
            };
            let duration = source.duration();

            // Only the newest buffer of a drained queue may signal completion
            state.end_of_queue = state.queue.is_empty().then_some(EndOfQueue {
                source: id,
                ends_at: start_at + duration,
            });

            state.metering.push_back(MeteredBuffer {
                start_at,
                samples: source.samples.clone(),
            });
            state.stats.samples_scheduled += source.samples.len() as u64;
            self.context.start_source(source);
            state.scheduled_time = start_at + duration;
        }
    }

    /// Run the level meter over everything that played since the last call
    fn meter_played(&self, state: &mut State) -> Vec<f32> {
        let now = self.context.current_time();
        let from = state.meter_cursor;
        if now <= from {
            return Vec::new();
        }
        let rate = f64::from(self.config.sample_rate);

        let mut played = Vec::new();
        while let Some(buffer) = state.metering.front() {
            if buffer.start_at >= now {
                break;
            }
            let len = buffer.samples.len();
            let lo = (((from - buffer.start_at).max(0.0) * rate) as usize).min(len);
            let hi = (((now - buffer.start_at) * rate) as usize).clamp(lo, len);
            played.extend_from_slice(&buffer.samples[lo..hi]);
            if hi < len {
                break;
            }
            state.metering.pop_front();
        }

        // Lead-in or a gap between buffers
        if played.is_empty() {
            played.resize(((now - from) * rate) as usize, 0.0);
        }
        state.meter_cursor = now;

        let mut levels = Vec::new();
        for block in played.chunks(RENDER_QUANTUM) {
            state.meter.process(block, &mut |level| levels.push(level));
        }
        levels
    }
}

enum Step {
    Sleep(Duration),
    Finish,
}

async fn run_schedule_loop(shared: Arc<Shared>, generation: u64) {
    loop {
        let mut fire = false;
        let step = {
            let mut state = shared.lock();
            // A stop since this cycle began retires the loop
            if state.generation != generation {
                return;
            }

            // Fill the look-ahead window
            shared.schedule_ready(&mut state);
            let now = shared.context.current_time();

            if state.queue.is_empty() {
                // Signal completion once the last buffer has played out
                if let Some(eoq) = state.end_of_queue {
                    if now >= eoq.ends_at {
                        debug!("Source {} ended the queue", eoq.source);
                        state.end_of_queue = None;
                        if !state.completion_fired {
                            state.completion_fired = true;
                            state.stats.completions += 1;
                            fire = true;
                        }
                    }
                }

                // Wait for the tail, for new data, or finish the cycle
                match state.end_of_queue {
                    Some(eoq) => Step::Sleep(wait_for(
                        (eoq.ends_at - now).min(shared.config.idle_poll_interval.as_secs_f64()),
                    )),
                    None if state.is_stream_complete => {
                        state.is_playing = false;
                        state.loop_task = None;
                        Step::Finish
                    }
                    None => Step::Sleep(shared.config.idle_poll_interval),
                }
            } else {
                // Wake just before the scheduled audio runs out
                let until_boundary = state.scheduled_time - now - shared.config.wake_margin;
                Step::Sleep(wait_for(until_boundary))
            }
        };

        if fire {
            shared.fire_complete();
        }

        match step {
            Step::Sleep(wait) => tokio::time::sleep(wait).await,
            Step::Finish => {
                debug!("Playback cycle finished");
                return;
            }
        }
    }
}

async fn run_level_meter(shared: Arc<Shared>, generation: u64) {
    let mut ticker = tokio::time::interval(shared.config.level_update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (levels, idle) = {
            let mut state = shared.lock();
            if state.generation != generation {
                return;
            }

            let levels = shared.meter_played(&mut state);
            let idle = !state.is_playing && state.metering.is_empty();
            if idle {
                state.meter_task = None;
            }
            (levels, idle)
        };

        for level in levels {
            shared.fire_level(level);
        }
        if idle {
            shared.fire_level(0.0);
            debug!("Output level meter idle");
            return;
        }
    }
}

/// Convert a wait in seconds to a sleep of at least one millisecond
fn wait_for(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.001))
}
