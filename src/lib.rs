//! Bramble cache server.
//!
//! An event-driven memcached-style server built around a per-connection
//! protocol state machine. Each reactor worker owns its connections outright
//! and drives them run-to-completion; mutations execute asynchronously on a
//! B-tree storage engine whose completions are posted back to the owning
//! reactor.

pub mod ascii;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod signal;
pub mod store;
pub mod worker;

pub use config::Config;
pub use connection::{BufferOptions, Connection, State};
pub use error::Error;
pub use event::{ConnId, Direction, Event, Verdict};
pub use handler::{ParseVerdict, RequestHandler};
pub use store::{BtreeStore, StoreReply};
