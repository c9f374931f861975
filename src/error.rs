//! Error types returned by the engine's synchronous API and carried on the
//! error signal (see [`crate::signals::Signal`]).

use thiserror::Error;

/// Errors produced by this crate.
///
/// Parse and transport errors encountered while servicing datagrams are
/// never returned to a caller; they are published on the signal bus and the
/// engine keeps running (spec §7). Only [`Error::UnknownPeer`],
/// [`Error::Timeout`], and [`Error::Bind`] are ever returned synchronously.
#[derive(Debug, Error)]
pub enum Error {
    /// A datagram failed to parse as a [`crate::protocol::Message`].
    #[error("invalid message: {0:?}")]
    Parse(String),

    /// Sending or binding a UDP socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An API call named a peer id that isn't in the peer table.
    #[error("unknown peer: {0}")]
    UnknownPeer(u64),

    /// An `eventReq` call was not satisfied within its timeout.
    #[error("timed out waiting for event {0:?}")]
    Timeout(String),

    /// A datagram's `command` field wasn't one this engine understands.
    #[error("unrecognized command: {0:?}")]
    UnknownCommand(String),

    /// An update's `status` field wasn't `alive`/`suspect`/`down`.
    #[error("unrecognized status: {0:?}")]
    UnknownStatus(String),

    /// `Engine::init` failed to bind its UDP socket.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
