//! The probe driver: PING → ack-or-timeout → indirect PING-REQ → suspect
//! (spec §4.3).
//!
//! `candidate_set.rs`'s `next()`/`report_failed()` pair shows the teacher's
//! idiom for this: hold the in-flight reconnection state (`next_peer_min_wait`)
//! alongside the shared peer table, and let a timer (`tokio::time::sleep_until`)
//! gate progress rather than spawning a dedicated task per attempt. This
//! module generalizes that into the three-stage probe/indirect-probe/suspect
//! escalation, while actually driving timers and sending datagrams is the
//! [`crate::engine::Engine`]'s job (so it can service inbound datagrams and
//! multiple concurrent probes from one mailbox, per spec §5).

use std::time::Instant;

use rand::Rng;

use crate::peer::PeerRecord;
use crate::status::PeerStatus;

/// Which stage of the probe/indirect-probe escalation a [`PendingProbe`] is
/// waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    /// Awaiting a direct ACK from the target (τ₁).
    AwaitDirectAck,
    /// τ₁ expired; awaiting an ACK relayed via an indirect peer, or
    /// directly from the target (τ₂).
    AwaitIndirectAck,
}

/// The peer to ACK back once a relay probe (initiated to answer an inbound
/// `ping-req`) resolves.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

/// One in-flight probe. The engine holds a collection of these: normally
/// exactly one scheduler-driven probe, plus zero or more relay probes
/// answering concurrent inbound `ping-req`s (spec §4.5: these are
/// independent and may overlap).
#[derive(Debug, Clone)]
pub struct PendingProbe {
    pub target_id: u64,
    pub stage: ProbeStage,
    pub deadline: Instant,
    /// Peer ids whose ACK resolves this probe at its current stage: just
    /// `target_id` while awaiting a direct ACK, or `[target_id,
    /// intermediary_id]` once escalated, since spec §4.3 step 4 accepts an
    /// ACK "from I (relayed) or from T directly" as resolving.
    pub awaiting_from: Vec<u64>,
    /// `Some` for a probe launched to answer an inbound `ping-req` (spec
    /// §4.4): on resolution, ACK `relay_to` instead of escalating or
    /// suspecting. `None` for the scheduler's own direct probe of a peer.
    pub relay_to: Option<RelayTarget>,
}

impl PendingProbe {
    /// A scheduler-driven direct probe of `target_id`.
    pub fn direct(target_id: u64, deadline: Instant) -> Self {
        PendingProbe {
            target_id,
            stage: ProbeStage::AwaitDirectAck,
            deadline,
            awaiting_from: vec![target_id],
            relay_to: None,
        }
    }

    /// A probe launched solely to answer an inbound `ping-req`: no indirect
    /// escalation, no suspect on timeout (spec §4.4) — it just expires.
    pub fn relay(target_id: u64, deadline: Instant, relay_to: RelayTarget) -> Self {
        PendingProbe {
            target_id,
            stage: ProbeStage::AwaitDirectAck,
            deadline,
            awaiting_from: vec![target_id],
            relay_to: Some(relay_to),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.relay_to.is_some()
    }

    /// Move from the direct to the indirect stage with a fresh deadline,
    /// now also accepting a relayed ACK from `intermediary_id`.
    pub fn escalate(&mut self, new_deadline: Instant, intermediary_id: u64) {
        self.stage = ProbeStage::AwaitIndirectAck;
        self.deadline = new_deadline;
        if !self.awaiting_from.contains(&intermediary_id) {
            self.awaiting_from.push(intermediary_id);
        }
    }
}

/// Choose one alive peer, uniformly at random, to act as the indirect-probe
/// intermediary for `target_id` (spec §4.3: "pick K = 1 other alive peer
/// uniformly at random from the peer table (re-roll if the selection
/// equals T)" — filtering `target_id` out up front makes the re-roll moot).
pub fn choose_indirect_peer<'a, R, I>(peers: I, target_id: u64, rng: &mut R) -> Option<u64>
where
    R: Rng + ?Sized,
    I: Iterator<Item = &'a PeerRecord>,
{
    let candidates: Vec<u64> = peers
        .filter(|p| p.id != target_id && p.status == PeerStatus::Alive)
        .map(|p| p.id)
        .collect();

    if candidates.is_empty() {
        None
    } else {
        Some(candidates[rng.gen_range(0..candidates.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn alive_peer(id: u64) -> PeerRecord {
        PeerRecord::new(id, "host", 9000)
    }

    #[test]
    fn choose_indirect_peer_excludes_target_and_non_alive() {
        let mut down = alive_peer(3);
        down.apply_update(0, PeerStatus::Down);
        let peers = vec![alive_peer(1), alive_peer(2), down];

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let chosen = choose_indirect_peer(peers.iter(), 1, &mut rng).unwrap();
            assert_ne!(chosen, 1);
            assert_ne!(chosen, 3, "down peers are never chosen as intermediaries");
        }
    }

    #[test]
    fn choose_indirect_peer_returns_none_with_no_candidates() {
        let peers = vec![alive_peer(1)];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(choose_indirect_peer(peers.iter(), 1, &mut rng), None);
    }

    #[test]
    fn escalate_moves_stage_and_deadline() {
        let now = Instant::now();
        let mut probe = PendingProbe::direct(1, now);
        let later = now + Duration::from_millis(500);
        probe.escalate(later, 9);
        assert_eq!(probe.stage, ProbeStage::AwaitIndirectAck);
        assert_eq!(probe.deadline, later);
        assert_eq!(probe.awaiting_from, vec![1, 9]);
    }

    #[test]
    fn relay_probe_is_marked_as_such() {
        let now = Instant::now();
        let probe = PendingProbe::relay(
            1,
            now,
            RelayTarget {
                id: 9,
                host: "h".into(),
                port: 1,
            },
        );
        assert!(probe.is_relay());
    }
}
