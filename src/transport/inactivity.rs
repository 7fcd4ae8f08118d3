//! # Inactivity Monitor
//!
//! Wraps a physical transport and enforces the negotiated liveness contract:
//! if no write has happened for half the negotiated inactivity period, a
//! KeepAliveInfo probe is sent; if no read has happened for a full period,
//! the transport is failed with "channel was inactive for too long".
//!
//! KeepAliveInfo probes are fire-and-forget: never tracked, never retried.
//! A negotiated `max_inactivity_duration` of zero disables the monitor
//! entirely and the wrapper becomes a transparent passthrough.

use crate::commands::{Command, CommandBody};
use crate::error::{Result, TransportError};
use crate::runtime;
use crate::transport::{ListenerSlot, Transport, TransportListener};
use crate::wire::WireFormat;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

struct MonitorShared {
    listener: ListenerSlot,
    epoch: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    closed: AtomicBool,
    failed: AtomicBool,
    stop_notify: Notify,
}

impl MonitorShared {
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn mark_read(&self) {
        self.last_read_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    fn mark_write(&self) {
        self.last_write_ms.store(self.elapsed_ms(), Ordering::Release);
    }
}

/// Forwards inner-transport events upward, marking read activity and
/// absorbing keep-alive probes on the way.
struct MonitorTap {
    shared: Arc<MonitorShared>,
}

impl TransportListener for MonitorTap {
    fn on_command(&self, command: Command) {
        self.shared.mark_read();
        if command.is_keep_alive() {
            trace!("keep-alive received");
            return;
        }
        if let Some(listener) = self.shared.listener.current() {
            listener.on_command(command);
        }
    }

    fn on_exception(&self, error: TransportError) {
        if let Some(listener) = self.shared.listener.current() {
            listener.on_exception(error);
        }
    }
}

/// Liveness wrapper around a physical transport.
pub struct InactivityMonitor {
    inner: Arc<dyn Transport>,
    shared: Arc<MonitorShared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl InactivityMonitor {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            shared: Arc::new(MonitorShared {
                listener: ListenerSlot::empty(),
                epoch: Instant::now(),
                last_read_ms: AtomicU64::new(0),
                last_write_ms: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
            timer: Mutex::new(None),
        }
    }

    fn spawn_timer(&self, wire: &WireFormat) {
        let read_limit = Duration::from_millis(wire.max_inactivity_duration.max(0) as u64);
        let initial_delay =
            Duration::from_millis(wire.max_inactivity_initial_delay.max(0) as u64);
        // Probes go out at half the negotiated write-check interval.
        let check_interval = read_limit / 2;

        let shared = self.shared.clone();
        let inner = self.inner.clone();
        let io = runtime::acquire();
        let task = io.spawn(async move {
            tokio::select! {
                _ = shared.stop_notify.notified() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            loop {
                tokio::select! {
                    _ = shared.stop_notify.notified() => break,
                    _ = tokio::time::sleep(check_interval) => {}
                }
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }

                let now = shared.elapsed_ms();
                let since_write =
                    now.saturating_sub(shared.last_write_ms.load(Ordering::Acquire));
                let since_read =
                    now.saturating_sub(shared.last_read_ms.load(Ordering::Acquire));

                if since_read >= read_limit.as_millis() as u64 {
                    if !shared.failed.swap(true, Ordering::SeqCst) {
                        let error = TransportError::Inactivity(format!(
                            "no traffic read for {since_read} ms (limit {} ms)",
                            read_limit.as_millis()
                        ));
                        warn!(%error, "inactivity check failed");
                        let _ = inner.close().await;
                        if let Some(listener) = shared.listener.current() {
                            listener.on_exception(error);
                        }
                    }
                    break;
                }

                if since_write >= check_interval.as_millis() as u64 {
                    trace!("sending keep-alive probe");
                    shared.mark_write();
                    if let Err(error) = inner.oneway(Command::new(CommandBody::KeepAliveInfo)).await
                    {
                        // The write failure will also surface through the
                        // reader; nothing further to do here.
                        debug!(%error, "keep-alive probe failed");
                        break;
                    }
                }
            }
        });
        *self.timer.lock() = Some(task);
        // The guard only accounted for the spawn; the timer owns its handle.
        drop(io);
    }
}

#[async_trait]
impl Transport for InactivityMonitor {
    async fn start(&self) -> Result<()> {
        self.inner.set_listener(Arc::new(MonitorTap { shared: self.shared.clone() }));
        self.inner.start().await?;
        self.shared.mark_read();
        self.shared.mark_write();

        match self.inner.wire_format() {
            Some(wire) if wire.max_inactivity_duration > 0 => {
                debug!(
                    period_ms = wire.max_inactivity_duration,
                    "inactivity monitoring enabled"
                );
                self.spawn_timer(&wire);
            }
            _ => trace!("inactivity monitoring disabled"),
        }
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        self.shared.mark_write();
        self.inner.oneway(command).await
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop_notify.notify_waiters();
        self.inner.close().await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.shared.listener.set(listener);
    }

    fn is_connected(&self) -> bool {
        !self.shared.failed.load(Ordering::Acquire) && self.inner.is_connected()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.inner.is_closed()
    }

    fn remote_address(&self) -> Option<String> {
        self.inner.remote_address()
    }

    fn wire_format(&self) -> Option<WireFormat> {
        self.inner.wire_format()
    }
}
