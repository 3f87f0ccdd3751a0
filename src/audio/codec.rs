//! PCM16 codec and sample-rate conversion
//!
//! Pure functions shared by the capture path (float -> PCM16 -> base64) and the
//! playback path (PCM16 bytes -> normalized float).

use base64::Engine;

use crate::Result;

/// Sample rate of audio sent to the model
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio streamed back by the model
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Convert `data` from `source_rate` to `target_rate`
///
/// Downsampling averages the source samples falling in each destination
/// sample's time window; upsampling interpolates linearly between neighbours.
/// Returns the input unchanged when the rates match.
pub fn resample(source_rate: u32, target_rate: u32, data: &[f32]) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = f64::from(source_rate) / f64::from(target_rate);
    let new_len = (data.len() as f64 / ratio).round() as usize;

    if target_rate > source_rate {
        return interpolate(data, ratio, new_len);
    }

    let mut result = Vec::with_capacity(new_len);
    let mut offset = 0usize;
    let mut last = 0.0f32;
    for i in 0..new_len {
        let next = (((i + 1) as f64) * ratio).round() as usize;
        let end = next.min(data.len());

        if end > offset {
            let window = &data[offset..end];
            last = window.iter().sum::<f32>() / window.len() as f32;
        }
        result.push(last);
        offset = next;
    }

    result
}

fn interpolate(data: &[f32], ratio: f64, new_len: usize) -> Vec<f32> {
    let last = data.len() - 1;

    (0..new_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let frac = (position - index as f64) as f32;
            let a = data[index];
            let b = data[(index + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Convert one float sample to a clamped signed 16-bit value
#[inline]
pub fn float_to_i16(sample: f32) -> i16 {
    let scaled = (sample.clamp(-1.0, 1.0) * 32768.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode float samples as little-endian PCM16 bytes
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_to_i16(s).to_le_bytes())
        .collect()
}

/// Decode little-endian PCM16 bytes into floats normalized by 32768
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Resample a captured frame to `target_rate` and encode it as base64 PCM16
pub fn encode_frame(source_rate: u32, target_rate: u32, samples: &[f32]) -> String {
    let resampled = resample(source_rate, target_rate, samples);
    to_base64(&encode_pcm16(&resampled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_i16_clamps() {
        assert_eq!(float_to_i16(0.0), 0);
        assert_eq!(float_to_i16(1.0), i16::MAX);
        assert_eq!(float_to_i16(2.5), i16::MAX);
        assert_eq!(float_to_i16(-1.0), i16::MIN);
        assert_eq!(float_to_i16(-3.0), i16::MIN);
        assert_eq!(float_to_i16(0.5), 16384);
    }

    #[test]
    fn test_decode_pcm16_normalizes() {
        let bytes: Vec<u8> = [i16::MIN, 0, 16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_pcm16(&bytes);

        assert_eq!(samples, vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_decode_pcm16_ignores_odd_byte() {
        assert_eq!(decode_pcm16(&[0, 0, 7]).len(), 1);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let data = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(16000, 16000, &data), data);
    }

    #[test]
    fn test_resample_48k_to_16k_tone() {
        // 3 seconds of constant amplitude
        let data = vec![0.25f32; 3 * 48000];
        let out = resample(48000, 16000, &data);

        assert_eq!(out.len(), 3 * 16000);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resample_averages_window() {
        let data = vec![0.0, 0.3, 0.6, 0.9, 0.9, 0.9];
        let out = resample(48000, 16000, &data);

        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let out = resample(24000, 48000, &[0.0, 1.0, 0.0]);

        assert_eq!(out.len(), 6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_upsample_non_integer_ratio() {
        let data: Vec<f32> = (0..240).map(|i| i as f32 / 240.0).collect();
        let out = resample(24000, 44100, &data);

        assert_eq!(out.len(), 441);
        // A ramp stays a monotonic ramp
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
        assert!(out.windows(2).all(|w| w[1] - w[0] < 1.0 / 240.0));
    }

    #[test]
    fn test_resample_44100_length_within_one() {
        let data = vec![0.0f32; 2048];
        let out = resample(44100, 16000, &data);
        let expected = 2048.0 * 16000.0 / 44100.0;

        assert!((out.len() as f64 - expected).abs() <= 1.0);
    }

    #[test]
    fn test_encode_frame_base64() {
        let encoded = encode_frame(16000, 16000, &[0.0, 0.5]);
        let bytes = from_base64(&encoded).unwrap();

        assert_eq!(bytes, vec![0, 0, 0x00, 0x40]);
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        assert!(from_base64("not base64!!").is_err());
    }
}
