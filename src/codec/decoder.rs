//! Opus decoder wrapper

use opus::{Channels, Decoder};

use crate::constants::{OPUS_MAX_DECODED_SAMPLES, OPUS_SAMPLE_RATE};
use crate::error::CodecError;

/// Mono 48 kHz Opus decoder
pub struct OpusDecoder {
    decoder: Decoder,
    /// Decoding buffer sized for the longest Opus frame
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
    samples_produced: u64,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(OPUS_SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; OPUS_MAX_DECODED_SAMPLES],
            frames_decoded: 0,
            samples_produced: 0,
        })
    }

    /// Decode an Opus packet to mono samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let samples = self
            .decoder
            .decode(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        self.samples_produced += samples as u64;

        Ok(self.decode_buffer[..samples].to_vec())
    }

    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn samples_produced(&self) -> u64 {
        self.samples_produced
    }
}
