use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::{CaptureConfig, PlaybackConfig};
use crate::session::LiveConfig;
use crate::voice::VoiceConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub session: SessionSettings,
    pub nats: NatsConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    #[serde(default)]
    pub response_modalities: Vec<String>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub voice_name: Option<String>,
    #[serde(default = "default_true")]
    pub input_audio_transcription: bool,
    #[serde(default = "default_true")]
    pub output_audio_transcription: bool,
    /// Failsafe wait for a close acknowledgment, in milliseconds
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    /// Subject prefix of live channels
    pub transport_prefix: String,
    pub interactions_subject: String,
    pub diagnostics_subject: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_frame_samples: usize,
    pub playback_buffer_samples: usize,
    pub initial_buffer_ms: u64,
    pub schedule_ahead_ms: u64,
    pub level_update_interval_ms: f64,
    pub volume_smoothing: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_frame_samples: 2048,
            playback_buffer_samples: 7680,
            initial_buffer_ms: 100,
            schedule_ahead_ms: 200,
            level_update_interval_ms: 25.0,
            volume_smoothing: 0.3,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_disconnect_timeout_ms() -> u64 {
    500
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .with_context(|| format!("Failed to read config {}", path))?;

        settings
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", path))
    }
}

impl SessionSettings {
    /// Default connect options for the live session
    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            response_modalities: self.response_modalities.clone(),
            system_instruction: self.system_instruction.clone(),
            voice_name: self.voice_name.clone(),
            input_audio_transcription: self.input_audio_transcription,
            output_audio_transcription: self.output_audio_transcription,
            ..Default::default()
        }
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl AudioConfig {
    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            target_sample_rate: self.input_sample_rate,
            frame_samples: self.capture_frame_samples,
            level_update_interval_ms: self.level_update_interval_ms,
            ..Default::default()
        }
    }

    pub fn voice(&self) -> VoiceConfig {
        VoiceConfig {
            playback: PlaybackConfig {
                sample_rate: self.output_sample_rate,
                buffer_size: self.playback_buffer_samples,
                initial_buffer_time: self.initial_buffer_ms as f64 / 1000.0,
                schedule_ahead_time: self.schedule_ahead_ms as f64 / 1000.0,
                level_update_interval: Duration::from_secs_f64(
                    self.level_update_interval_ms.max(1.0) / 1000.0,
                ),
                ..Default::default()
            },
            volume_smoothing: self.volume_smoothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_defaults() {
        let audio = AudioConfig::default();
        let voice = audio.voice();

        assert_eq!(audio.capture().target_sample_rate, 16000);
        assert_eq!(voice.playback.buffer_size, 7680);
        assert!((voice.playback.initial_buffer_time - 0.1).abs() < 1e-9);
        assert!((voice.playback.schedule_ahead_time - 0.2).abs() < 1e-9);
    }
}
