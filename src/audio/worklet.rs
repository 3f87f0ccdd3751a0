//! Real-time audio thread processors
//!
//! Both processors run inside the device callback. They never fail and never
//! block on their own; they hand owned payloads to the caller-provided emitter,
//! which is the only way data leaves the audio thread.

/// Samples per capture frame (about 8 frames per second at 16kHz)
pub const CAPTURE_FRAME_SAMPLES: usize = 2048;

/// Default interval between level updates
pub const LEVEL_UPDATE_INTERVAL_MS: f64 = 25.0;

/// Per-block decay applied to the previous level estimate
const LEVEL_DECAY: f32 = 0.7;

/// Message posted from the audio thread to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum WorkletMessage {
    /// A full capture frame at the device sample rate
    Chunk(Vec<f32>),
    /// Decaying RMS level estimate
    Level(f32),
}

/// Buffers microphone samples into fixed-size frames
#[derive(Debug)]
pub struct CaptureWorklet {
    buffer: Vec<f32>,
    write_index: usize,
}

impl CaptureWorklet {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; frame_samples.max(1)],
            write_index: 0,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Number of samples waiting for the current frame to fill
    pub fn pending(&self) -> usize {
        self.write_index
    }

    /// Copy `input` into the frame buffer, emitting every frame that fills
    pub fn process(&mut self, mut input: &[f32], emit: &mut dyn FnMut(Vec<f32>)) {
        while !input.is_empty() {
            let space_left = self.buffer.len() - self.write_index;
            if space_left == 0 {
                self.flush(emit);
                continue;
            }

            let n = input.len().min(space_left);
            self.buffer[self.write_index..self.write_index + n].copy_from_slice(&input[..n]);
            self.write_index += n;
            input = &input[n..];
        }

        if self.write_index >= self.buffer.len() {
            self.flush(emit);
        }
    }

    fn flush(&mut self, emit: &mut dyn FnMut(Vec<f32>)) {
        emit(self.buffer[..self.write_index].to_vec());
        self.write_index = 0;
    }
}

impl Default for CaptureWorklet {
    fn default() -> Self {
        Self::new(CAPTURE_FRAME_SAMPLES)
    }
}

/// Decaying RMS volume estimator
#[derive(Debug)]
pub struct LevelMeterWorklet {
    sample_rate: u32,
    volume: f32,
    update_interval_ms: f64,
    next_update_frame: f64,
}

impl LevelMeterWorklet {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            volume: 0.0,
            update_interval_ms: LEVEL_UPDATE_INTERVAL_MS,
            next_update_frame: LEVEL_UPDATE_INTERVAL_MS,
        }
    }

    pub fn set_update_interval_ms(&mut self, interval_ms: f64) {
        if interval_ms > 0.0 {
            self.update_interval_ms = interval_ms;
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Drop the running estimate and restart the update interval
    pub fn reset(&mut self) {
        self.volume = 0.0;
        self.next_update_frame = self.update_interval_ms;
    }

    fn interval_in_frames(&self) -> f64 {
        self.update_interval_ms / 1000.0 * f64::from(self.sample_rate)
    }

    /// Fold one block into the estimate and emit a level when an interval elapses
    pub fn process(&mut self, samples: &[f32], emit: &mut dyn FnMut(f32)) {
        if samples.is_empty() {
            return;
        }

        let sum: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum / samples.len() as f32).sqrt();
        self.volume = rms.max(self.volume * LEVEL_DECAY);

        self.next_update_frame -= samples.len() as f64;
        if self.next_update_frame < 0.0 {
            self.next_update_frame += self.interval_in_frames();
            emit(self.volume);
        }
    }
}

/// Both capture processors fed from one device callback
#[derive(Debug)]
pub struct CaptureGraph {
    recorder: CaptureWorklet,
    meter: LevelMeterWorklet,
}

impl CaptureGraph {
    pub fn new(sample_rate: u32, frame_samples: usize) -> Self {
        Self {
            recorder: CaptureWorklet::new(frame_samples),
            meter: LevelMeterWorklet::new(sample_rate),
        }
    }

    pub fn set_level_interval_ms(&mut self, interval_ms: f64) {
        self.meter.set_update_interval_ms(interval_ms);
    }

    pub fn process(&mut self, input: &[f32], post: &mut dyn FnMut(WorkletMessage)) {
        self.recorder
            .process(input, &mut |frame| post(WorkletMessage::Chunk(frame)));
        self.meter
            .process(input, &mut |level| post(WorkletMessage::Level(level)));
    }
}
