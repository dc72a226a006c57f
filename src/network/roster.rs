//! Frequency roster
//!
//! The session forgets its joins on every reconnect. The roster remembers
//! what the caller asked for so it can be replayed after
//! [`SupervisorEvent::Reconnected`](crate::network::SupervisorEvent::Reconnected).

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::network::session::TransportSession;

#[derive(Debug, Default)]
pub struct FrequencyRoster {
    /// Frequency id to requested server mute
    entries: Mutex<BTreeMap<i32, bool>>,
}

impl FrequencyRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_join(&self, freq_id: i32) {
        self.entries.lock().entry(freq_id).or_insert(false);
    }

    pub fn record_leave(&self, freq_id: i32) {
        self.entries.lock().remove(&freq_id);
    }

    pub fn record_mute(&self, freq_id: i32, muted: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&freq_id) {
            *entry = muted;
        }
    }

    /// Join through the session and remember it
    pub async fn join(&self, session: &TransportSession, freq_id: i32) -> bool {
        self.record_join(freq_id);
        session.join_frequency(freq_id).await
    }

    pub async fn leave(&self, session: &TransportSession, freq_id: i32) -> bool {
        self.record_leave(freq_id);
        session.leave_frequency(freq_id).await
    }

    pub async fn set_muted(&self, session: &TransportSession, freq_id: i32, muted: bool) -> bool {
        self.record_mute(freq_id, muted);
        if muted {
            session.mute_frequency(freq_id).await
        } else {
            session.unmute_frequency(freq_id).await
        }
    }

    pub fn frequencies(&self) -> Vec<i32> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn is_muted(&self, freq_id: i32) -> bool {
        self.entries.lock().get(&freq_id).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Re-join every recorded frequency and re-push mutes.
    /// Returns how many joins were sent.
    pub async fn restore(&self, session: &TransportSession) -> usize {
        let entries: Vec<(i32, bool)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, muted)| (*id, *muted))
            .collect();

        let mut rejoined = 0;
        for (freq_id, muted) in entries {
            if !session.join_frequency(freq_id).await {
                tracing::warn!("Could not re-join frequency {}", freq_id);
                continue;
            }
            rejoined += 1;
            if muted {
                session.mute_frequency(freq_id).await;
            }
        }
        tracing::info!("Re-joined {} frequencies", rejoined);
        rejoined
    }
}
