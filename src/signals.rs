//! The subscribable signal bus (spec §6, §9).
//!
//! The source re-architected here used a process-wide string-keyed event
//! bus (`"alive:42"`, `"ack"`, ...). Per the redesign note in spec §9, this
//! crate replaces it with one strongly-typed [`Signal`] enum delivered over
//! a single [`tokio::sync::broadcast`] channel owned by the
//! [`crate::engine::Engine`]. Peer-local lifecycle events carry the peer id
//! so a single subscriber can filter for the peer(s) it cares about, which
//! is what the source's `"alive:42"`-style keys were doing by hand.

use tokio::sync::broadcast;

use crate::status::PeerStatus;

/// An event the engine makes observable to external subscribers.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A recoverable error occurred while servicing a datagram or protocol
    /// period. The engine keeps running.
    Error(String),

    /// An inbound datagram named a `sender_id`/`target_id` this engine
    /// could not resolve and could not auto-register (e.g. a `ping-req`
    /// target with no known address).
    PeerNotFound(u64),

    /// An inbound datagram's `command` field wasn't recognized.
    UnrecognizedCommand(String),

    /// An update's `status` field wasn't recognized.
    UnrecognizedStatus(String),

    /// Peer `id` transitioned to a new status.
    StatusChanged { id: u64, status: PeerStatus },

    /// Peer `id`'s sequence advanced (possibly without a status change).
    Sequence { id: u64, sequence: u64 },

    /// An `ack` was received from peer `id`.
    Ack { id: u64 },

    /// A named test-support event fired locally.
    Event { from: u64, name: String },
}

/// Capacity of the broadcast channel's ring buffer. Generous enough that a
/// slow subscriber over one protocol period won't lag under normal churn;
/// subscribers that fall behind receive [`broadcast::error::RecvError::Lagged`]
/// rather than blocking the engine, since the engine never awaits a
/// subscriber.
const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// Owns the send half of the signal bus and hands out receivers.
///
/// Cloning shares the same underlying channel (`broadcast::Sender` is a
/// cheap `Arc`-backed handle), so the engine can keep one clone for itself
/// and hand another to its spawned event-loop task.
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        SignalBus { sender }
    }

    /// Publish a signal. Never blocks; if there are no subscribers the
    /// signal is simply dropped.
    pub fn emit(&self, signal: Signal) {
        // A broadcast send only errors when there are no receivers, which
        // is a perfectly normal state for this engine (nobody's watching).
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = SignalBus::new();
        bus.emit(Signal::Error("boom".into()));
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_signal() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Signal::PeerNotFound(7));
        match rx.recv().await.unwrap() {
            Signal::PeerNotFound(id) => assert_eq!(id, 7),
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}
