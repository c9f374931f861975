//! The per-peer status state machine (spec §4.2), the SWIM analogue of
//! `zebra-network`'s `MetaAddr`.
//!
//! Where `MetaAddr` tracks a Bitcoin peer's reconnection-order state
//! (`Responded`/`NeverAttempted`/`Failed`/`AttemptPending`, see `meta_addr.rs`),
//! `PeerRecord` tracks a SWIM peer's failure-detection state
//! (`alive`/`suspect`/`down`) driven by gossiped `(sequence, status)` pairs
//! and direct observations rather than reconnection bookkeeping.

use std::time::Instant;

use crate::status::PeerStatus;

/// A status-change or sequence-advance event produced by applying an input
/// to a [`PeerRecord`]. The engine turns these into buffered [`crate::update::Update`]s
/// and signals on [`crate::signals::SignalBus`]; the peer record itself never
/// touches the buffer or the signal bus directly (spec §5: peer-state events
/// must not themselves originate further state-changing work).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer's status changed. Carries the peer's sequence at the time
    /// of the transition, for building the outgoing [`crate::update::Update`].
    StatusChanged(PeerStatus),
    /// The peer's sequence advanced, independent of any status change.
    Sequence(u64),
}

/// One remote node known to the engine (spec §3).
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub status: PeerStatus,
    pub sequence: u64,
    /// The sequence at which this peer was last declared down, or -1.
    /// Prevents a stale reordered down-assertion from re-firing the down
    /// transition for a peer that has already recovered (spec §3).
    pub last_down_sequence: i64,
    /// Local monotonic time of the most recent status transition. Not part
    /// of the wire protocol; observability-only (`SPEC_FULL.md` §3.1).
    pub last_state_change: Instant,
}

impl PeerRecord {
    pub fn new(id: u64, host: impl Into<String>, port: u16) -> Self {
        PeerRecord {
            id,
            host: host.into(),
            port,
            status: PeerStatus::Alive,
            sequence: 0,
            last_down_sequence: -1,
            last_state_change: Instant::now(),
        }
    }

    fn transition(&mut self, new_status: PeerStatus, events: &mut Vec<PeerEvent>) {
        self.status = new_status;
        self.last_state_change = Instant::now();
        events.push(PeerEvent::StatusChanged(new_status));
    }

    /// The universal pre-rule (spec §4.2): any incoming sequence strictly
    /// greater than our own bumps our sequence and emits a `sequence`
    /// event, before the transition table is consulted.
    fn bump_sequence(&mut self, incoming: u64, events: &mut Vec<PeerEvent>) {
        if incoming > self.sequence {
            self.sequence = incoming;
            events.push(PeerEvent::Sequence(self.sequence));
        }
    }

    /// Declare the peer down at `sequence`. Guarded two ways:
    /// - `sequence >= own_before` (the peer's sequence immediately before
    ///   this update) so that a down assertion can never undo a more recent
    ///   alive declaration (invariant 5: alive at S blocks down at ≤ S).
    /// - `sequence > last_down_sequence` so a stale or duplicate replay of
    ///   a down assertion we've already acted on doesn't re-fire the event.
    fn handle_down(&mut self, sequence: u64, own_before: u64, events: &mut Vec<PeerEvent>) {
        if sequence >= own_before && sequence as i64 > self.last_down_sequence {
            self.last_down_sequence = sequence as i64;
            if self.status != PeerStatus::Down {
                self.transition(PeerStatus::Down, events);
            }
        }
    }

    /// Apply a gossiped `(sequence, status)` assertion, per the transition
    /// table in spec §4.2. Returns the events produced, in order.
    pub fn apply_update(&mut self, sequence: u64, status: PeerStatus) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        let own_before = self.sequence;
        self.bump_sequence(sequence, &mut events);

        use PeerStatus::*;
        match (self.status, status) {
            (Alive, Suspect) => {
                if sequence >= own_before {
                    self.transition(Suspect, &mut events);
                }
            }
            (Alive, Down) => self.handle_down(sequence, own_before, &mut events),
            (Alive, Alive) => {}

            (Suspect, Alive) => {
                if sequence > own_before {
                    self.transition(Alive, &mut events);
                }
            }
            (Suspect, Suspect) => {}
            (Suspect, Down) => self.handle_down(sequence, own_before, &mut events),

            (Down, Alive) => {
                if sequence > own_before {
                    self.transition(Alive, &mut events);
                }
            }
            (Down, Suspect) => {
                // suspect cannot revive a down peer
            }
            (Down, Down) => self.handle_down(sequence, own_before, &mut events),
        }

        events
    }

    /// A direct observation (`ack`, `ping`, or `ping-req` received from this
    /// peer itself). Only `suspect` peers are revived by this; `alive`
    /// peers are unaffected, and `down` peers require a proper
    /// higher-sequence `alive` gossip update instead (spec §4.2's table has
    /// no "down, direct observation" row).
    pub fn on_direct_observation(&mut self) -> Option<PeerEvent> {
        if self.status == PeerStatus::Suspect {
            let mut events = Vec::new();
            self.transition(PeerStatus::Alive, &mut events);
            events.pop()
        } else {
            None
        }
    }

    /// Escalate to `suspect`. Idempotent outside `alive` (spec §4.3): a
    /// peer already `suspect` or `down` is left unchanged.
    pub fn suspect(&mut self) -> Option<PeerEvent> {
        if self.status == PeerStatus::Alive {
            let mut events = Vec::new();
            self.transition(PeerStatus::Suspect, &mut events);
            events.pop()
        } else {
            None
        }
    }

    /// The suspect→down timeout (τ₃) fired without a refuting observation.
    pub fn suspect_timeout_expired(&mut self) -> Option<PeerEvent> {
        if self.status == PeerStatus::Suspect {
            let sequence = self.sequence;
            let mut events = Vec::new();
            self.handle_down(sequence, sequence, &mut events);
            events.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PeerStatus::*;

    fn peer() -> PeerRecord {
        PeerRecord::new(1, "10.0.0.1", 9000)
    }

    #[test]
    fn starts_alive_with_sequence_zero() {
        let p = peer();
        assert_eq!(p.status, Alive);
        assert_eq!(p.sequence, 0);
        assert_eq!(p.last_down_sequence, -1);
    }

    #[test]
    fn sequence_only_ever_increases() {
        let mut p = peer();
        p.apply_update(5, Alive);
        assert_eq!(p.sequence, 5);
        p.apply_update(2, Alive); // stale, ignored
        assert_eq!(p.sequence, 5);
        p.apply_update(9, Alive);
        assert_eq!(p.sequence, 9);
    }

    /// Scenario 3 (probe fail -> indirect probe fail) and the suspect row of
    /// §4.2's table: alive + suspect(seq >= own) -> suspect.
    #[test]
    fn alive_to_suspect_on_suspect_update_with_sequence_at_least_own() {
        let mut p = peer();
        let events = p.apply_update(0, Suspect);
        assert_eq!(p.status, Suspect);
        assert_eq!(events, vec![PeerEvent::StatusChanged(Suspect)]);
    }

    #[test]
    fn stale_suspect_update_is_ignored() {
        let mut p = peer();
        p.apply_update(5, Alive);
        let events = p.apply_update(3, Suspect);
        assert_eq!(p.status, Alive);
        assert!(events.is_empty());
    }

    /// Scenario 4: suspect -> down via suspect-timeout expiry.
    #[test]
    fn suspect_timeout_marks_down() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        let event = p.suspect_timeout_expired();
        assert_eq!(p.status, Down);
        assert_eq!(event, Some(PeerEvent::StatusChanged(Down)));
        assert_eq!(p.last_down_sequence, 0);
    }

    /// Scenario 5: suspect -> alive via direct observation.
    #[test]
    fn direct_observation_revives_suspect_peer() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        let event = p.on_direct_observation();
        assert_eq!(p.status, Alive);
        assert_eq!(event, Some(PeerEvent::StatusChanged(Alive)));
    }

    #[test]
    fn direct_observation_is_noop_when_already_alive() {
        let mut p = peer();
        assert_eq!(p.on_direct_observation(), None);
        assert_eq!(p.status, Alive);
    }

    #[test]
    fn direct_observation_does_not_revive_down_peer() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        p.suspect_timeout_expired();
        assert_eq!(p.status, Down);
        assert_eq!(p.on_direct_observation(), None);
        assert_eq!(p.status, Down);
    }

    #[test]
    fn suspect_is_idempotent_outside_alive() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        assert_eq!(p.suspect(), None);
        assert_eq!(p.status, Suspect);

        p.suspect_timeout_expired();
        assert_eq!(p.status, Down);
        assert_eq!(p.suspect(), None);
        assert_eq!(p.status, Down);
    }

    /// Invariant 6: a suspect update can never revive a down peer.
    #[test]
    fn suspect_update_cannot_revive_down_peer() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        p.suspect_timeout_expired();
        assert_eq!(p.status, Down);

        let events = p.apply_update(100, Suspect);
        assert_eq!(p.status, Down);
        // sequence still advances even though status doesn't
        assert_eq!(p.sequence, 100);
        assert_eq!(events, vec![PeerEvent::Sequence(100)]);
    }

    /// Invariant 5: alive declared at S cannot be re-declared down at
    /// sequence ≤ S once it has already come back up.
    #[test]
    fn down_cannot_be_redeclared_at_or_below_recovery_sequence() {
        let mut p = peer();
        p.apply_update(0, Suspect);
        p.suspect_timeout_expired(); // down at seq 0, last_down_sequence = 0
        p.apply_update(10, Alive); // strictly higher sequence revives it
        assert_eq!(p.status, Alive);

        // a reordered, stale down-assertion at sequence 7 (<= the recovery
        // sequence 10) must not undo the recovery.
        let events = p.apply_update(7, Down);
        assert_eq!(p.status, Alive);
        assert!(events.is_empty());

        // but a down-assertion strictly above the recovery sequence is
        // honored.
        let events = p.apply_update(11, Down);
        assert_eq!(p.status, Down);
        assert!(events.contains(&PeerEvent::StatusChanged(Down)));
    }

    #[test]
    fn down_update_requires_higher_last_down_sequence_to_refire() {
        let mut p = peer();
        p.apply_update(5, Down);
        assert_eq!(p.status, Down);
        assert_eq!(p.last_down_sequence, 5);

        // duplicate / stale down update at or below the recorded down
        // sequence is a no-op (already down, nothing new to report)
        let events = p.apply_update(5, Down);
        assert!(events.is_empty());
        assert_eq!(p.status, Down);
    }

    #[test]
    fn alive_update_with_equal_sequence_does_not_revive_down_peer() {
        let mut p = peer();
        p.apply_update(5, Down);
        let events = p.apply_update(5, Alive);
        assert_eq!(p.status, Down);
        assert!(events.is_empty());
    }
}
