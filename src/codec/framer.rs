//! Outbound voice framing
//!
//! Accumulates converted PCM until a full 20 ms frame is available, applies
//! the master input gain, encodes and tags each frame with the frequency id
//! and the transmission's sequence number. Partial frames stay buffered and
//! are never encoded short.

use crate::audio::format::apply_gain;
use crate::codec::OpusEncoder;
use crate::config::OpusConfig;
use crate::constants::{MAX_GAIN, OPUS_FRAME_SAMPLES};
use crate::error::CodecError;
use crate::protocol::AudioPacket;

/// Per-transmission encoder state
pub struct VoiceFramer {
    encoder: OpusEncoder,
    pending: Vec<i16>,
    sequence: u32,
    gain: f32,
    encode_errors: u64,
}

impl VoiceFramer {
    pub fn new(config: &OpusConfig, gain: f32) -> Result<Self, CodecError> {
        Ok(Self {
            encoder: OpusEncoder::voice(config)?,
            pending: Vec::with_capacity(OPUS_FRAME_SAMPLES * 2),
            sequence: 0,
            gain: gain.clamp(0.0, MAX_GAIN),
            encode_errors: 0,
        })
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, MAX_GAIN);
    }

    /// Append mono 48 kHz samples and return every packet completed by them
    pub fn push(&mut self, freq_id: i32, samples: &[i16]) -> Vec<AudioPacket> {
        self.pending.extend_from_slice(samples);

        let mut packets = Vec::with_capacity(self.pending.len() / OPUS_FRAME_SAMPLES);
        let mut frame = [0i16; OPUS_FRAME_SAMPLES];
        let mut consumed = 0;

        while self.pending.len() - consumed >= OPUS_FRAME_SAMPLES {
            let chunk = &self.pending[consumed..consumed + OPUS_FRAME_SAMPLES];
            for (out, &sample) in frame.iter_mut().zip(chunk) {
                *out = apply_gain(sample, self.gain);
            }
            consumed += OPUS_FRAME_SAMPLES;

            match self.encoder.encode(&frame) {
                Ok(payload) => {
                    packets.push(AudioPacket::new(freq_id, self.sequence, payload));
                    self.sequence = self.sequence.wrapping_add(1);
                }
                Err(e) => {
                    self.encode_errors += 1;
                    tracing::debug!("Skipping frame: {}", e);
                }
            }
        }

        self.pending.drain(..consumed);
        packets
    }

    /// Drop buffered audio and restart numbering at 0
    pub fn reset(&mut self) {
        self.pending.clear();
        self.sequence = 0;
    }

    /// Samples waiting for the next full frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors
    }
}
