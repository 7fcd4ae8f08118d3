//! # OpenWire Failover Transport
//!
//! A fault-tolerant client transport for OpenWire brokers. The library
//! presents a single stable endpoint to upper layers while internally
//! managing a pool of candidate broker URIs, transparent reconnection with
//! exponential backoff, command replay, and session-state restoration
//! across physical transport failures.

pub mod advisory;
pub mod audit;
pub mod bench;
pub mod broker;
pub mod cli;
pub mod commands;
pub mod error;
pub mod failover;
pub mod furi;
pub mod metrics;
pub mod runtime;
pub mod state;
pub mod transport;
pub mod wire;

pub use audit::MessageAudit;
pub use commands::{Command, CommandBody};
pub use error::{Result, TransportError};
pub use failover::FailoverTransport;
pub use furi::{BrokerUri, FailoverConfig, FailoverUri};
pub use transport::{Transport, TransportListener};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Wire protocol version this crate proposes in its handshake.
    pub const WIRE_VERSION: u32 = 1;

    /// Max time a Message send blocks waiting for a connection; also the
    /// default socket connect timeout.
    pub const SEND_TIMEOUT_MS: u64 = 30_000;

    /// Delay before the first reconnect retry.
    pub const INITIAL_RECONNECT_DELAY_MS: u64 = 10;

    /// Ceiling for the exponential backoff between retries.
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Geometric growth factor of the reconnect delay.
    pub const BACKOFF_MULTIPLIER: u32 = 2;

    /// Per-URI reconnect attempt cap; negative means infinite.
    pub const MAX_RECONNECT_ATTEMPTS: i32 = 20;

    /// Hot standby transports held when backups are enabled.
    pub const BACKUP_POOL_SIZE: usize = 1;

    /// Entries kept in the replayable message cache.
    pub const MAX_CACHE_SIZE: usize = 128 * 1024;

    /// Entries kept in the replayable pull cache.
    pub const MAX_PULL_CACHE_SIZE: usize = 10;

    /// Every blocking wait in the library wakes at least this often to
    /// re-check the closed flag.
    pub const CLOSE_POLL_INTERVAL_MS: u64 = 100;

    /// Proposed read-inactivity limit; the negotiated minimum wins.
    pub const MAX_INACTIVITY_DURATION_MS: i64 = 30_000;

    /// Grace period before the first inactivity check.
    pub const MAX_INACTIVITY_INITIAL_DELAY_MS: i64 = 10_000;

    /// Proposed maximum frame size; the negotiated minimum wins.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Slots in each producer's duplicate-detection window.
    pub const AUDIT_WINDOW: usize = 2048;

    /// Producers tracked by one audit before LRU eviction.
    pub const AUDIT_MAX_PRODUCERS: usize = 64;

    /// Upper bound on waiting for the task-runner worker at close.
    pub const TASK_RUNNER_SHUTDOWN_SECS: u64 = 300;
}
