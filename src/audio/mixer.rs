//! Per-frequency mixing
//!
//! Each frequency has its own volume, pan and mute. Decoded mono frames
//! are rendered to interleaved stereo with
//!
//! ```text
//! left  = min(1, 2·(1 − pan)) · volume · master
//! right = min(1, 2·pan)       · volume · master
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::format::apply_gain;
use crate::constants::MAX_GAIN;

/// Playback settings for one frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencySettings {
    /// 0.0 ..= 1.25
    pub volume: f32,
    /// 0.0 = left, 0.5 = centre, 1.0 = right
    pub pan: f32,
    pub muted: bool,
}

impl Default for FrequencySettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.5,
            muted: false,
        }
    }
}

impl FrequencySettings {
    pub fn new(volume: f32, pan: f32, muted: bool) -> Self {
        Self {
            volume: volume.clamp(0.0, MAX_GAIN),
            pan: pan.clamp(0.0, 1.0),
            muted,
        }
    }

    /// Left and right gains for this frequency
    pub fn gains(&self) -> (f32, f32) {
        let left = (2.0 * (1.0 - self.pan)).min(1.0) * self.volume;
        let right = (2.0 * self.pan).min(1.0) * self.volume;
        (left, right)
    }
}

/// Concurrent map of frequency id to playback settings.
///
/// Written by the UI side, read by the inbound audio loop. Every update
/// replaces one entry atomically; unknown frequencies play with defaults.
#[derive(Debug, Default)]
pub struct FrequencyTable {
    entries: DashMap<i32, FrequencySettings>,
}

impl FrequencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, freq_id: i32) -> FrequencySettings {
        self.entries
            .get(&freq_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    pub fn set(&self, freq_id: i32, settings: FrequencySettings) {
        self.entries.insert(
            freq_id,
            FrequencySettings::new(settings.volume, settings.pan, settings.muted),
        );
    }

    pub fn set_volume(&self, freq_id: i32, volume: f32) {
        self.entries.entry(freq_id).or_default().volume = volume.clamp(0.0, MAX_GAIN);
    }

    pub fn set_pan(&self, freq_id: i32, pan: f32) {
        self.entries.entry(freq_id).or_default().pan = pan.clamp(0.0, 1.0);
    }

    pub fn set_muted(&self, freq_id: i32, muted: bool) {
        self.entries.entry(freq_id).or_default().muted = muted;
    }

    pub fn is_muted(&self, freq_id: i32) -> bool {
        self.get(freq_id).muted
    }

    pub fn remove(&self, freq_id: i32) {
        self.entries.remove(&freq_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Renders decoded mono voice into stereo using the frequency table
pub struct Mixer {
    table: Arc<FrequencyTable>,
    /// Master output volume stored as f32 bits
    master: AtomicU32,
}

impl Mixer {
    pub fn new(table: Arc<FrequencyTable>) -> Self {
        Self {
            table,
            master: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn table(&self) -> &Arc<FrequencyTable> {
        &self.table
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master
            .store(volume.clamp(0.0, MAX_GAIN).to_bits(), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master.load(Ordering::Relaxed))
    }

    /// Effective stereo gains for a frequency, or `None` when it is muted
    pub fn gains_for(&self, freq_id: i32) -> Option<(f32, f32)> {
        let settings = self.table.get(freq_id);
        if settings.muted {
            return None;
        }
        let master = self.master_volume();
        let (left, right) = settings.gains();
        Some((left * master, right * master))
    }

    /// Render a mono frame for `freq_id` to interleaved stereo.
    /// Returns `None` when the frequency is muted.
    pub fn render(&self, freq_id: i32, mono: &[i16]) -> Option<Vec<i16>> {
        let (left, right) = self.gains_for(freq_id)?;
        Some(render_stereo(mono, left, right))
    }
}

/// Spread a mono frame over two channels with independent gains
pub fn render_stereo(mono: &[i16], left_gain: f32, right_gain: f32) -> Vec<i16> {
    let mut out = Vec::with_capacity(mono.len() * 2);
    for &sample in mono {
        out.push(apply_gain(sample, left_gain));
        out.push(apply_gain(sample, right_gain));
    }
    out
}
