//! The piggybacked-update dissemination buffer (spec §4.1).

use serde::{Deserialize, Serialize};

use crate::status::PeerStatus;

/// One assertion about a peer's status, ready to ride on an outgoing
/// datagram.
///
/// `count` is transmitted but receiver-ignored (spec §6): a receiving
/// engine always resets it to 0 when it buffers an update it decides to
/// keep propagating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub id: u64,
    pub sequence: u64,
    pub status: PeerStatus,
    /// How many outbound messages have carried this update so far.
    #[serde(default)]
    pub count: u32,
    /// Present only on updates that bootstrap an unknown peer (spec §3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Update {
    /// Construct a fresh update with `count = 0` and no bootstrap address.
    pub fn new(id: u64, sequence: u64, status: PeerStatus) -> Self {
        Update {
            id,
            sequence,
            status,
            count: 0,
            host: None,
            port: None,
        }
    }

    /// Attach bootstrap addressing information, for updates that introduce
    /// a peer the receiver may not yet know (spec §3).
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

/// Bounded, priority-ordered dissemination queue (spec §4.1).
///
/// Entries are evicted once `count` reaches `limit = round(ln(N+1) · k)`,
/// where `N` is the size of the engine's peer table and `k` is the
/// dissemination factor (spec §6, default 3). Duplicates are permitted;
/// they age out independently, exactly as the spec calls for.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    entries: Vec<Update>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        UpdateBuffer {
            entries: Vec::new(),
        }
    }

    /// `limit = round(ln(N+1) · k)` (spec §4.1).
    pub fn limit(peer_table_size: usize, dissemination_factor: f64) -> u32 {
        let n = peer_table_size as f64;
        ((n + 1.0).ln() * dissemination_factor).round() as u32
    }

    /// Append `update` to the buffer with `count` reset to 0. Duplicates
    /// are allowed.
    pub fn add(&mut self, mut update: Update) {
        update.count = 0;
        self.entries.push(update);
    }

    /// Number of live (non-evicted) entries currently buffered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return up to `max_updates` least-disseminated still-live updates,
    /// incrementing each returned entry's `count`, and permanently evicting
    /// anything that has reached `limit` (spec §4.1).
    ///
    /// Ties in `count` are broken in insertion order (`Vec::sort_by` is
    /// stable, so a plain sort by `count` alone suffices).
    pub fn take(
        &mut self,
        peer_table_size: usize,
        dissemination_factor: f64,
        max_updates: usize,
    ) -> Vec<Update> {
        let limit = Self::limit(peer_table_size, dissemination_factor);

        self.entries.retain(|u| u.count < limit);
        self.entries.sort_by_key(|u| u.count);

        let taken = self.entries.len().min(max_updates);
        for entry in self.entries.iter_mut().take(taken) {
            entry.count += 1;
        }
        self.entries[..taken].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_with_count(id: u64, count: u32) -> Update {
        let mut u = Update::new(id, 0, PeerStatus::Alive);
        u.count = count;
        u
    }

    /// Scenario 1 from spec §8: N=20 peers, limit = round(ln(21)·3) = 9.
    #[test]
    fn take_evicts_at_limit_and_orders_by_count() {
        assert_eq!(UpdateBuffer::limit(20, 3.0), 9);

        let mut buf = UpdateBuffer::new();
        // counts: {limit-3, limit-2, limit-1, limit-1, limit-1, limit}
        for (i, count) in [6, 7, 8, 8, 8, 9].into_iter().enumerate() {
            let mut u = update_with_count(i as u64, count);
            u.id = i as u64;
            buf.entries.push(u);
        }

        let taken = buf.take(20, 3.0, 6);

        // the count=9 (== limit) entry is evicted before selection; the
        // remaining five are returned in ascending-count order.
        assert_eq!(taken.len(), 5);
        assert_eq!(taken.iter().map(|u| u.count).collect::<Vec<_>>(), vec![
            7, 8, 9, 9, 9
        ]);
        // the evicted (count == limit) entry never reappears
        assert_eq!(buf.entries.len(), 5);
    }

    #[test]
    fn add_resets_count_to_zero() {
        let mut buf = UpdateBuffer::new();
        let mut u = Update::new(1, 5, PeerStatus::Suspect);
        u.count = 3;
        buf.add(u);
        assert_eq!(buf.entries[0].count, 0);
    }

    #[test]
    fn take_caps_at_max_updates() {
        let mut buf = UpdateBuffer::new();
        for id in 0..10 {
            buf.add(Update::new(id, 0, PeerStatus::Alive));
        }
        let taken = buf.take(10, 3.0, 6);
        assert_eq!(taken.len(), 6);
    }

    #[test]
    fn duplicates_age_out_independently() {
        let mut buf = UpdateBuffer::new();
        buf.add(Update::new(1, 0, PeerStatus::Alive));
        buf.add(Update::new(1, 0, PeerStatus::Alive));
        assert_eq!(buf.len(), 2);

        let limit = UpdateBuffer::limit(0, 3.0);
        for _ in 0..limit {
            buf.take(0, 3.0, 6);
        }
        // both copies reached `limit` together and are evicted together
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_buffer_takes_nothing() {
        let mut buf = UpdateBuffer::new();
        assert!(buf.take(5, 3.0, 6).is_empty());
    }
}
