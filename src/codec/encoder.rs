//! Opus encoder wrapper
//!
//! Fixed voice configuration: 48 kHz, mono, VoIP application, 20 ms frames.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::OpusConfig;
use crate::constants::{OPUS_FRAME_SAMPLES, OPUS_MAX_PACKET_SIZE, OPUS_SAMPLE_RATE};
use crate::error::CodecError;

/// Opus encoder for one transmission
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a voice encoder with the given bitrate settings
    pub fn voice(config: &OpusConfig) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(OPUS_SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        Ok(Self {
            encoder,
            config: config.clone(),
            encode_buffer: vec![0u8; OPUS_MAX_PACKET_SIZE],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode exactly one 960-sample mono frame
    pub fn encode(&mut self, frame: &[i16]) -> Result<Bytes, CodecError> {
        if frame.len() != OPUS_FRAME_SAMPLES {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let size = self
            .encoder
            .encode(frame, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
