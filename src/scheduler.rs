//! The protocol-period scheduler (spec §4.5).

use rand::seq::SliceRandom;
use rand::Rng;

/// Round-robins an index over a peer array of length `len`, reshuffling a
/// caller-supplied ordering once the cycle wraps.
///
/// The scheduler itself holds no peer data; it only tracks where the next
/// probe should land. The engine owns the actual peer array (an
/// [`indexmap::IndexMap`], spec §3) and is responsible for reshuffling its
/// iteration order when [`Scheduler::advance`] reports a wraparound.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_index: usize,
}

/// What happened when the scheduler advanced past one protocol period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// No peers to probe this period.
    Empty,
    /// Probe `peers[index]`; no wraparound yet.
    Probe { index: usize },
    /// Probe `peers[index]`, and this was the last peer in the current
    /// epoch: the caller must shuffle its peer ordering before the next
    /// period (spec §4.5 step 3).
    ProbeAndWrap { index: usize },
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { next_index: 0 }
    }

    /// Advance one protocol period over a peer array of length `len`.
    pub fn advance(&mut self, len: usize) -> Advance {
        if len == 0 {
            return Advance::Empty;
        }
        let index = self.next_index;
        self.next_index += 1;
        if self.next_index >= len {
            self.next_index = 0;
            Advance::ProbeAndWrap { index }
        } else {
            Advance::Probe { index }
        }
    }

    /// Current position, for tests/observability.
    pub fn position(&self) -> usize {
        self.next_index
    }
}

/// Fisher–Yates shuffle, in place, using `rng`. A thin named wrapper over
/// `rand::seq::SliceRandom::shuffle` so call sites read as the spec's
/// "shuffle the peer array" rather than a library incantation, and so tests
/// can pass a seeded `rng` for determinism (spec §9: "deterministic seeding
/// is desirable for tests").
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    items.shuffle(rng);
}
