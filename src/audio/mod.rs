//! Audio subsystem module

pub mod buffer;
#[cfg(feature = "device-playback")]
pub mod device;
pub mod format;
pub mod mixer;
pub mod playback;

pub use buffer::SampleRing;
#[cfg(feature = "device-playback")]
pub use device::{list_output_devices, OutputDeviceInfo};
pub use format::{PcmFormat, SampleFormat};
pub use mixer::{FrequencySettings, FrequencyTable, Mixer};
pub use playback::PlaybackOutput;
