//! Tunables for the protocol engine (spec §6).

use std::time::Duration;

/// Configuration for an [`crate::engine::Engine`].
///
/// Mirrors the configuration options enumerated in spec §6. All timer
/// fields are expressed as [`Duration`]s; the spec's "Ms" suffixes are
/// dropped since the type makes the unit unambiguous.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's cluster-unique integer identifier.
    pub id: u64,

    /// UDP bind host.
    pub host: String,

    /// UDP bind port.
    pub port: u16,

    /// τ: the timeout used for the direct-probe ack, the indirect-probe
    /// ack, and the suspect-to-down deadline alike (spec §4.3).
    ///
    /// Default: 1000 ms.
    pub probe_timeout: Duration,

    /// T_p: the cadence of the protocol-period scheduler (spec §4.5).
    ///
    /// Default: 2 × `probe_timeout`.
    pub protocol_period: Duration,

    /// Cap on the number of updates piggybacked on one outgoing message
    /// (spec §4.1, invariant 4).
    ///
    /// Default: 6.
    pub max_piggyback_updates: usize,

    /// `k` in `limit = round(ln(N+1) · k)` (spec §4.1).
    ///
    /// Default: 3.
    pub dissemination_factor: f64,
}

/// Default probe timeout (τ), per spec §9's recommended value.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

impl Config {
    /// Build a config for `id` bound to `host:port`, with all other fields
    /// at their spec-recommended defaults.
    pub fn new(id: u64, host: impl Into<String>, port: u16) -> Self {
        Config {
            id,
            host: host.into(),
            port,
            ..Config::default()
        }
    }
}

impl Default for Config {
    /// The tunables default to their spec-recommended values; `id`/`host`/
    /// `port` default to placeholders, since this node's identity has no
    /// sensible protocol-wide default — callers normally set these via
    /// [`Config::new`] instead.
    fn default() -> Self {
        Config {
            id: 0,
            host: String::new(),
            port: 0,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            protocol_period: DEFAULT_PROBE_TIMEOUT * 2,
            max_piggyback_updates: 6,
            dissemination_factor: 3.0,
        }
    }
}
