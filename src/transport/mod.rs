//! # Transport Abstraction
//!
//! This module defines the unified interface every transport layer
//! implements, from the raw TCP transport up through the inactivity monitor,
//! the response correlator, and the failover transport itself.
//!
//! ## Layering
//!
//! ```text
//! ┌──────────────────┐
//! │ FailoverTransport│  virtual, survives physical failures
//! └────────┬─────────┘
//! ┌────────┴─────────┐
//! │ResponseCorrelator│  command ids, request/response futures
//! └────────┬─────────┘
//! ┌────────┴─────────┐
//! │InactivityMonitor │  keep-alives, read-check
//! └────────┬─────────┘
//! ┌────────┴─────────┐
//! │   TcpTransport   │  socket, framing, negotiation
//! └──────────────────┘
//! ```
//!
//! Each layer forwards commands downward through [`Transport::oneway`] and
//! events upward through its [`TransportListener`]. Listener callbacks are
//! synchronous and must not block: they run on the reader task of the
//! physical transport.

use crate::commands::{Command, Response};
use crate::error::{Result, TransportError};
use crate::wire::WireFormat;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub mod correlator;
pub mod inactivity;
pub mod tcp;

pub use correlator::{CommandIdSequence, ResponseCorrelator};
pub use inactivity::InactivityMonitor;
pub use tcp::{TcpConfig, TcpTransport};

/// Capability set a transport reports events into.
///
/// Implementations must be prepared for calls from the transport's reader
/// task; exceptions never unwind across this boundary, so hooks return unit
/// and handle their own failures.
pub trait TransportListener: Send + Sync {
    /// An inbound command arrived.
    fn on_command(&self, command: Command);

    /// The transport failed. Called at most once per physical transport.
    fn on_exception(&self, error: TransportError);

    /// The logical connection lost its physical transport (failover only).
    fn transport_interrupted(&self) {}

    /// The logical connection is usable again after a reconnect.
    fn transport_resumed(&self) {}
}

/// No-op listener installed on a transport that is being discarded, so late
/// events from its reader cannot re-enter a layer that is shutting down.
pub struct DisposedListener;

impl TransportListener for DisposedListener {
    fn on_command(&self, _command: Command) {}
    fn on_exception(&self, _error: TransportError) {}
}

/// Completion hook for [`Transport::async_request`]: invoked exactly once
/// with the Response, the broker's exception, the timeout, or the transport
/// failure, whichever arrives first.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Transport")
    }
}

/// The interface shared by every transport layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the transport. For physical transports this connects the
    /// socket and completes the wire-format handshake.
    async fn start(&self) -> Result<()>;

    /// Sends a command without waiting for any broker response.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Sends a response-required command and waits for the broker's answer.
    ///
    /// Not every layer supports this; the failover transport in particular
    /// rejects it because its sends are retried across reconnects.
    async fn request(&self, command: Command, timeout: Duration) -> Result<Response> {
        let _ = (command, timeout);
        Err(TransportError::Unsupported("request".to_string()))
    }

    /// Sends a response-required command and delivers the outcome to
    /// `callback` without blocking the caller beyond the write itself.
    ///
    /// Supported by the correlation layer only; the same policy as
    /// [`Transport::request`] applies to the layers above and below it.
    async fn async_request(
        &self,
        command: Command,
        timeout: Duration,
        callback: ResponseCallback,
    ) -> Result<()> {
        let _ = (command, timeout, callback);
        Err(TransportError::Unsupported("asyncRequest".to_string()))
    }

    /// Closes the transport. Idempotent, callable from any thread including
    /// from inside a listener callback of this very transport.
    async fn close(&self) -> Result<()>;

    /// Installs the upper listener. Replaces any previous listener.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// True when this transport recovers from physical failures on its own.
    fn is_fault_tolerant(&self) -> bool {
        false
    }

    /// Address of the connected peer, if any.
    fn remote_address(&self) -> Option<String> {
        None
    }

    /// The negotiated wire parameters, once the handshake completed.
    fn wire_format(&self) -> Option<WireFormat> {
        None
    }
}

/// Shared holder for the listener pointer of a transport layer.
///
/// Wraps the lock so replacement cannot race with delivery; `current()`
/// clones the `Arc` out and the lock is never held while the listener runs.
pub struct ListenerSlot {
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
}

impl ListenerSlot {
    pub fn empty() -> Self {
        Self { listener: Mutex::new(None) }
    }

    pub fn set(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Bounded-acquisition replacement used where a shutdown in progress may
    /// hold the slot: tries for `attempts × pause`, then falls back to a
    /// blocking set. The critical sections here are pointer swaps only and
    /// are never held across callbacks, so the fallback cannot deadlock; the
    /// bounded phase just keeps the common path from ever queueing behind a
    /// slow teardown.
    pub fn set_with_retries(
        &self,
        listener: Arc<dyn TransportListener>,
        attempts: usize,
        pause: std::time::Duration,
    ) {
        for _ in 0..attempts {
            if let Some(mut slot) = self.listener.try_lock_for(pause) {
                *slot = Some(listener);
                return;
            }
        }
        *self.listener.lock() = Some(listener);
    }

    pub fn clear(&self) {
        *self.listener.lock() = None;
    }

    pub fn current(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl Default for ListenerSlot {
    fn default() -> Self {
        Self::empty()
    }
}
