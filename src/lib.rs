//! # Relay Voice
//!
//! Real-time radio-frequency voice client for a WebSocket relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 CLIENT                                   │
//! │                                                                          │
//! │   capture PCM (any rate/channels)                                        │
//! │        │                                                                 │
//! │        ▼                                                                 │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────┐                   │
//! │  │ audio::     │──▶│ codec::      │──▶│ network::    │  drop-oldest      │
//! │  │ format      │   │ VoiceFramer  │   │AudioSendQueue│  (capacity 200)   │
//! │  │ mono 48 kHz │   │ 960-sample   │   └──────┬───────┘                   │
//! │  └─────────────┘   │ Opus frames  │          │                           │
//! │                    └──────────────┘          ▼                           │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │        TransportSession (network::session) - one WebSocket         │  │
//! │  │   text: JSON control (auth/join/leave/mute/ping)                   │  │
//! │  │   binary: [freqId|seq|Opus]                                        │  │
//! │  │   loops: inbound read · audio drain · heartbeat                    │  │
//! │  └───────────────┬─────────────────────────────────────▲──────────────┘  │
//! │                  │ inbound audio                       │ LinkSignal      │
//! │                  ▼                                     │                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┴─────────────┐   │
//! │  │ codec::      │──▶│ audio::Mixer │   │ ReconnectSupervisor         │   │
//! │  │ OpusDecoder  │   │ vol/pan/mute │   │ back-off + jitter, retries  │   │
//! │  └──────────────┘   └──────┬───────┘   └─────────────────────────────┘   │
//! │                            ▼                                             │
//! │                   ┌─────────────────┐                                    │
//! │                   │ PlaybackOutput  │  stereo ring, drop-oldest          │
//! │                   └─────────────────┘                                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate of everything on the wire
    pub const OPUS_SAMPLE_RATE: u32 = 48_000;

    /// Voice is carried as mono
    pub const OPUS_CHANNELS: u16 = 1;

    /// Opus frame duration in milliseconds
    pub const OPUS_FRAME_MS: u32 = 20;

    /// Samples in one 20 ms frame at 48 kHz
    pub const OPUS_FRAME_SAMPLES: usize = (OPUS_SAMPLE_RATE * OPUS_FRAME_MS / 1000) as usize;

    /// Target bitrate for voice in bits per second
    pub const OPUS_BITRATE: u32 = 32_000;

    /// Largest encoded frame we reserve space for
    pub const OPUS_MAX_PACKET_SIZE: usize = 4000;

    /// Largest decoded frame (120 ms at 48 kHz mono)
    pub const OPUS_MAX_DECODED_SAMPLES: usize = 5760;

    /// Playback is always interleaved stereo
    pub const PLAYBACK_CHANNELS: u16 = 2;

    /// Upper bound for volume and gain settings
    pub const MAX_GAIN: f32 = 1.25;

    /// Path of the voice endpoint on the relay
    pub const VOICE_PATH: &str = "/voice";
}
