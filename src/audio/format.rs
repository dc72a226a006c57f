//! PCM format conversion
//!
//! Everything captured is brought to the wire format before encoding:
//! 16-bit signed, mono, 48 kHz. Channels are averaged, other rates are
//! linearly interpolated, and the result is hard-clamped.

use crate::constants::OPUS_SAMPLE_RATE;
use crate::error::AudioError;

/// Sample encoding of a raw capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Little-endian signed 16-bit
    I16,
    /// Little-endian IEEE 32-bit float in [-1, 1]
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Description of a raw interleaved capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// 16-bit mono 48 kHz, the wire format
    pub fn wire() -> Self {
        Self::new(OPUS_SAMPLE_RATE, 1, SampleFormat::I16)
    }

    pub fn is_wire(&self) -> bool {
        *self == Self::wire()
    }

    fn check(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("sample rate 0".to_string()));
        }
        if self.channels == 0 {
            return Err(AudioError::UnsupportedFormat("zero channels".to_string()));
        }
        Ok(())
    }
}

/// Convert a raw capture buffer to 16-bit mono 48 kHz samples.
///
/// A trailing partial sample frame is ignored.
pub fn to_wire_pcm(data: &[u8], format: PcmFormat) -> Result<Vec<i16>, AudioError> {
    format.check()?;

    if format.is_wire() {
        return Ok(data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect());
    }

    let mono = downmix(data, format);
    let resampled = resample_linear(&mono, format.sample_rate, OPUS_SAMPLE_RATE);
    Ok(resampled.into_iter().map(float_to_i16).collect())
}

/// Average all channels of each sample frame into one float sample
pub fn downmix(data: &[u8], format: PcmFormat) -> Vec<f32> {
    let width = format.sample_format.bytes_per_sample();
    let channels = format.channels as usize;
    let frame_bytes = width * channels;

    data.chunks_exact(frame_bytes)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(width)
                .map(|s| match format.sample_format {
                    SampleFormat::I16 => i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0,
                    SampleFormat::F32 => f32::from_le_bytes([s[0], s[1], s[2], s[3]]),
                })
                .sum();
            sum / channels as f32
        })
        .collect()
}

/// Resample by linear interpolation between neighbouring samples.
///
/// Output length is `floor(len * to / from)`.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (input.len() as f64 * ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let t = i as f64 / ratio;
        let idx = t as usize;
        let frac = (t - idx as f64) as f32;
        let sample = if idx + 1 < input.len() {
            input[idx] * (1.0 - frac) + input[idx + 1] * frac
        } else {
            input[input.len() - 1]
        };
        output.push(sample);
    }

    output
}

/// Float sample in [-1, 1] to 16-bit with hard clamping
#[inline]
pub fn float_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Multiply a 16-bit sample by a gain, clamped instead of wrapping
#[inline]
pub fn apply_gain(sample: i16, gain: f32) -> i16 {
    (sample as f32 * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode 16-bit samples as little-endian bytes
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Encode float samples as little-endian bytes
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
