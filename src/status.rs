//! Peer liveness status, the SWIM counterpart of `zebra-network`'s
//! `PeerAddrState`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;

use PeerStatus::*;

/// The status of a remote node, as tracked by the engine's peer state
/// machine (spec §4.2).
///
/// The source code's two terminal-absence spellings ("down" and "faulty")
/// are unified on `Down` (spec §9's open-question resolution).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// The peer is believed reachable.
    Alive,
    /// The peer failed a probe and hasn't been refuted within the suspect
    /// timeout yet.
    Suspect,
    /// The peer is believed unreachable. Terminal until a strictly higher
    /// sequence brings it back to `Alive`.
    Down,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Alive
    }
}

impl PeerStatus {
    /// Parse a wire status string, surfacing `unrecognized-status` (spec
    /// §4.4) for anything else.
    pub fn parse(s: &str) -> Result<Self, crate::error::Error> {
        match s {
            "alive" => Ok(Alive),
            "suspect" => Ok(Suspect),
            "down" => Ok(Down),
            other => Err(crate::error::Error::UnknownStatus(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Alive => "alive",
            Suspect => "suspect",
            Down => "down",
        }
    }
}

/// `PeerStatus`es are ordered by how far along the failure-detection path
/// they are: `Alive < Suspect < Down`. This is used only to decide which of
/// two conflicting-sequence assertions is "more severe" when logging or
/// reporting; it has no bearing on the transition table in spec §4.2, which
/// is driven by `(sequence, status)` pairs, not this ordering alone.
impl Ord for PeerStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(s: &PeerStatus) -> u8 {
            match s {
                Alive => 0,
                Suspect => 1,
                Down => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

impl PartialOrd for PeerStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_reflects_severity() {
        assert!(Alive < Suspect);
        assert!(Suspect < Down);
    }

    #[test]
    fn parse_round_trips_known_variants() {
        for variant in [Alive, Suspect, Down] {
            assert_eq!(PeerStatus::parse(variant.as_str()).unwrap(), variant);
        }
    }

    #[test]
    fn parse_rejects_unknown_status() {
        let err = PeerStatus::parse("zombie").unwrap_err();
        assert!(matches!(err, crate::error::Error::UnknownStatus(s) if s == "zombie"));
    }

    #[test]
    fn default_is_alive() {
        assert_eq!(PeerStatus::default(), Alive);
    }
}
