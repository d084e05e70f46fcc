//! Server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "requests_get", description = "Total GET operations")]
pub static GETS: Counter = Counter::new();

#[metric(name = "requests_set", description = "Total storage operations")]
pub static SETS: Counter = Counter::new();

#[metric(name = "requests_delete", description = "Total DELETE operations")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "store_hits", description = "Total read hits")]
pub static HITS: Counter = Counter::new();

#[metric(name = "store_misses", description = "Total read misses")]
pub static MISSES: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Total protocol parse errors")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Total bytes read from clients")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to clients")]
pub static BYTES_SENT: Counter = Counter::new();

/// Reason a connection was torn down, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed (or quit) cleanly.
    Quit,
    /// Peer closed mid-request.
    NoData,
    /// An event arrived that violated the state machine contract.
    Invalid,
    /// Unrecoverable I/O or protocol-limit error.
    Fatal,
    /// Server shutdown.
    Shutdown,
}
