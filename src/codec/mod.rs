//! Opus codec wrapper
//!
//! Voice encoding and decoding plus the outbound frame accumulator.

pub mod decoder;
pub mod encoder;
pub mod framer;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use framer::VoiceFramer;
