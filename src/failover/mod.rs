//! # Failover Transport
//!
//! The top-level virtual transport: presents one stable endpoint to upper
//! layers while internally managing a pool of candidate broker URIs,
//! transparent reconnection with exponential backoff, command replay, and
//! session-state restoration across physical transport failures.
//!
//! ## Moving parts
//!
//! - a [`UriPool`] of candidates (plus a broker-pushed "updated" pool that
//!   supersedes it when cluster updates are enabled),
//! - an optional [`BackupTransportPool`] of hot standbys,
//! - the [`ConnectionStateTracker`] shadowing broker-visible state,
//! - a request map of response-required commands awaiting their Response,
//! - one [`CompositeTaskRunner`] worker executing the reconnect iteration
//!   and the transport disposer.
//!
//! ## Locking
//!
//! `reconnect state` (connected transport, pools, counters, flags) lives
//! behind a single mutex that is never held across a network write or a
//! listener callback. Blocking waiters poll with a 100 ms tick so `close()`
//! is never more than one tick away from being observed.

use crate::commands::{
    Command, CommandBody, CommandId, ConnectionControl, ConnectionId, MessageDispatch, Response,
};
use crate::error::{Result, TransportError};
use crate::furi::{BrokerUri, FailoverConfig, FailoverUri};
use crate::state::{ConnectionStateTracker, Tracked, TrackerConfig};
use crate::transport::{
    CommandIdSequence, DisposedListener, InactivityMonitor, ListenerSlot, ResponseCorrelator,
    TcpConfig, TcpTransport, Transport, TransportListener,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

pub mod backup;
pub mod task;
pub mod uri_pool;

pub use backup::{BackupTransportPool, PhysicalTransportFactory};
pub use task::{CloseTransportsTask, CompositeTask, CompositeTaskRunner};
pub use uri_pool::UriPool;

const POLL: Duration = Duration::from_millis(crate::defaults::CLOSE_POLL_INTERVAL_MS);

/// A parked response-required command awaiting its broker Response.
enum RequestEntry {
    /// Held by the state tracker; retired through its response hook.
    Tracked(Arc<Tracked>),
    /// Not state-tracked; replayed verbatim on reconnect.
    Plain(Command),
}

impl RequestEntry {
    fn command(&self) -> Command {
        match self {
            RequestEntry::Tracked(tracked) => tracked.command().clone(),
            RequestEntry::Plain(command) => command.clone(),
        }
    }
}

struct ReconnectState {
    uris: UriPool,
    /// Broker-advertised pool; supersedes `uris` while non-empty.
    updated: UriPool,
    connected_transport: Option<Arc<dyn Transport>>,
    connected_uri: Option<BrokerUri>,
    /// A transport mid-`start()`, recorded so close() can cancel it.
    connecting: Option<Arc<dyn Transport>>,
    connection_failure: Option<TransportError>,
    do_rebalance: bool,
    first_connection: bool,
    connect_failures: u32,
    reconnect_delay: Duration,
    uri_failure_counts: HashMap<String, u32>,
    connected_to_priority: bool,
}

impl ReconnectState {
    fn active_pool(&mut self, updates_supported: bool) -> &mut UriPool {
        // The updated pool is always preferred when updates are enabled and
        // the broker has given us one; otherwise fall back to the original
        // list so we always try something.
        if updates_supported && !self.updated.is_empty() {
            &mut self.updated
        } else {
            &mut self.uris
        }
    }

    fn active_pool_ref(&self, updates_supported: bool) -> &UriPool {
        if updates_supported && !self.updated.is_empty() {
            &self.updated
        } else {
            &self.uris
        }
    }

    fn uri_failure_count(&self, uri: &BrokerUri) -> u32 {
        self.uri_failure_counts.get(&uri.to_string()).copied().unwrap_or(0)
    }

    fn record_uri_failure(&mut self, uri: &BrokerUri) -> u32 {
        let count = self.uri_failure_counts.entry(uri.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn is_uri_exhausted(&self, uri: &BrokerUri, limit: i32) -> bool {
        limit >= 0 && self.uri_failure_count(uri) >= limit as u32
    }

    fn all_uris_exhausted(&self, updates_supported: bool, limit: i32) -> bool {
        if limit < 0 {
            return false;
        }
        self.active_pool_ref(updates_supported)
            .uri_list()
            .iter()
            .all(|uri| self.is_uri_exhausted(uri, limit))
    }
}

struct FailoverInner {
    config: FailoverConfig,
    transport_params: BTreeMap<String, String>,

    closed: AtomicBool,
    connected: AtomicBool,
    started: AtomicBool,
    /// Latched once a ShutdownInfo went out; expected socket drops are then
    /// not treated as failures.
    shutdown_sent: AtomicBool,

    state: Mutex<ReconnectState>,
    /// Wakes senders blocked on connection state changes.
    reconnect_notify: Notify,
    /// Wakes the backoff sleep.
    sleep_notify: Notify,

    listener: ListenerSlot,
    listener_notify: Notify,

    request_map: Mutex<BTreeMap<CommandId, RequestEntry>>,

    tracker: ConnectionStateTracker,
    sequence: CommandIdSequence,

    backups: BackupTransportPool,
    close_task: Arc<CloseTransportsTask>,
    task_runner: CompositeTaskRunner,

    /// The listener this transport installs on every physical transport.
    my_listener: Mutex<Option<Arc<dyn TransportListener>>>,
}

impl FailoverInner {
    fn my_listener(&self) -> Arc<dyn TransportListener> {
        self.my_listener.lock().clone().expect("listener installed at construction")
    }

    fn is_closed_or_failed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.state.lock().connection_failure.is_some()
    }

    /// A valid connection is one we intend to keep: present, not marked for
    /// rebalance, and not trumped by an available priority backup.
    fn is_connection_state_valid(&self) -> bool {
        let state = self.state.lock();
        state.connected_transport.is_some()
            && !state.do_rebalance
            && !(self.backups.is_priority_backup_available() && !state.connected_to_priority)
    }

    fn reconnect_attempt_limit(&self, state: &ReconnectState) -> i32 {
        if state.first_connection && self.config.startup_max_reconnect_attempts >= 0 {
            self.config.startup_max_reconnect_attempts
        } else {
            self.config.max_reconnect_attempts
        }
    }

    fn can_reconnect(&self, state: &ReconnectState) -> bool {
        self.started.load(Ordering::Acquire) && self.reconnect_attempt_limit(state) != 0
    }

    fn will_reconnect(&self) -> bool {
        let state = self.state.lock();
        state.first_connection || self.reconnect_attempt_limit(&state) != 0
    }

    fn is_priority_uri(&self, state: &ReconnectState, uri: &BrokerUri) -> bool {
        self.config.priority_uris.contains(uri)
            || state.active_pool_ref(self.config.update_uris_supported).is_priority(uri)
    }

    fn reset_reconnect_delay(&self, state: &mut ReconnectState) {
        if !self.config.use_exponential_backoff {
            state.reconnect_delay = self.config.initial_reconnect_delay;
        }
    }

    /// Builds the full physical stack for one endpoint:
    /// TCP → inactivity monitor → response correlator (shared id sequence).
    fn create_transport(&self, uri: &BrokerUri) -> Result<Arc<dyn Transport>> {
        if uri.scheme != "tcp" {
            return Err(TransportError::Configuration(format!(
                "unsupported transport scheme '{}'",
                uri.scheme
            )));
        }
        // The failover timeout doubles as the default socket connect
        // timeout unless the URI pins its own.
        let uri = if self.config.timeout > Duration::ZERO {
            uri.with_default_param(
                "soConnectTimeout",
                self.config.timeout.as_millis().to_string(),
            )
        } else {
            uri.clone()
        };
        let tcp_config = TcpConfig::from_uri(&uri, &self.transport_params)?;
        let tcp: Arc<dyn Transport> = Arc::new(TcpTransport::new(uri, tcp_config));
        let monitor: Arc<dyn Transport> = Arc::new(InactivityMonitor::new(tcp));
        let correlator: Arc<dyn Transport> =
            Arc::new(ResponseCorrelator::with_sequence(monitor, self.sequence.clone()));
        Ok(correlator)
    }

    /// Swaps out the connected transport (if any) into the disposer. Must be
    /// called with `state` locked; fires `transport_interrupted` only after
    /// the caller released the lock, via the returned flag.
    fn disconnect_locked(&self, state: &mut ReconnectState) -> bool {
        let Some(transport) = state.connected_transport.take() else {
            return false;
        };
        transport.set_listener(Arc::new(DisposedListener));
        self.close_task.add(transport);
        self.task_runner.wakeup();

        if let Some(uri) = state.connected_uri.take() {
            state.uris.return_uri(&uri);
        }
        self.connected.store(false, Ordering::Release);
        state.connected_to_priority = false;
        true
    }

    fn notify_interrupted(&self) {
        self.tracker.transport_interrupted();
        if let Some(listener) = self.listener.current() {
            listener.transport_interrupted();
        }
    }

    /// Reacts to a physical transport failure: dispose, requeue the URI, and
    /// either schedule a reconnect or latch the terminal failure.
    fn handle_transport_failure(&self, error: &TransportError) {
        if self.shutdown_sent.load(Ordering::Acquire) {
            // ShutdownInfo went out; the socket dropping is expected and the
            // close path owns the cleanup.
            return;
        }
        error!(%error, "transport failure detected");

        let (had_transport, reconnect_ok) = {
            let mut state = self.state.lock();
            let Some(transport) = state.connected_transport.take() else {
                return;
            };
            transport.set_listener(Arc::new(DisposedListener));
            self.close_task.add(transport);

            let reconnect_ok = self.can_reconnect(&state);
            let failed_uri = state.connected_uri.take();
            if let Some(uri) = &failed_uri {
                state.uris.return_uri(uri);
                if reconnect_ok {
                    state.updated.remove(uri);
                }
            }
            self.connected.store(false, Ordering::Release);
            state.connected_to_priority = false;

            if !reconnect_ok && !self.closed.load(Ordering::Acquire) {
                state.connection_failure = Some(error.duplicate());
            }
            (true, reconnect_ok)
        };

        if had_transport {
            // Give consumers a chance to clean their state up before the
            // reconnect races them. Outside every lock.
            self.notify_interrupted();
            if reconnect_ok {
                self.task_runner.wakeup();
            } else if !self.closed.load(Ordering::Acquire) {
                self.propagate_failure_to_listener();
            }
            self.reconnect_notify.notify_waiters();
            self.task_runner.wakeup();
        }
    }

    /// Must be called with no lock held.
    fn propagate_failure_to_listener(&self) {
        let failure = self.state.lock().connection_failure.as_ref().map(|e| e.duplicate());
        if let Some(failure) = failure {
            if let Some(listener) = self.listener.current() {
                listener.on_exception(failure);
            }
        }
        self.reconnect_notify.notify_waiters();
    }

    /// Retires a request-map entry when its Response (or ExceptionResponse)
    /// arrives from the broker.
    fn process_response(&self, correlation_id: CommandId) {
        let entry = self.request_map.lock().remove(&correlation_id);
        if let Some(RequestEntry::Tracked(tracked)) = entry {
            tracked.on_response(&self.tracker);
        }
    }

    fn handle_connection_control(&self, control: &ConnectionControl) {
        let reconnect_to = control.reconnect_to.trim();
        if !reconnect_to.is_empty() && self.config.reconnect_supported {
            match BrokerUri::parse(reconnect_to) {
                Ok(uri) => {
                    debug!(uri = %uri, "broker requested reconnect");
                    let changed = self.state.lock().uris.add(uri);
                    if changed {
                        self.request_reconnect(true);
                    }
                }
                Err(error) => warn!(%error, "ignoring unparsable reconnectTo"),
            }
        }

        let brokers = control.connected_brokers.trim();
        if !brokers.is_empty() && self.config.update_uris_supported {
            let mut parsed = Vec::new();
            for piece in brokers.split(',').filter(|p| !p.trim().is_empty()) {
                match BrokerUri::parse(piece) {
                    Ok(uri) => parsed.push(uri),
                    Err(error) => warn!(%error, "ignoring unparsable connected broker"),
                }
            }
            if !parsed.is_empty() {
                let rebalance =
                    control.rebalance_connection && self.config.rebalance_update_uris;
                self.update_uris(rebalance, &parsed);
            }
        }
    }

    fn update_uris(&self, rebalance: bool, uris: &[BrokerUri]) {
        if !self.config.update_uris_supported {
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            let previous = state.updated.clone();
            state.updated.clear();
            for uri in uris {
                state.updated.add(uri.clone());
            }
            !previous.same_members(&state.updated)
        };
        if changed {
            info!(count = uris.len(), "broker URI list updated");
            self.request_reconnect(rebalance);
        }
    }

    fn request_reconnect(&self, rebalance: bool) {
        if self.started.load(Ordering::Acquire) {
            if rebalance {
                self.state.lock().do_rebalance = true;
            }
            self.task_runner.wakeup();
        }
    }

    /// Brings a fresh transport up to the tracked broker state and replays
    /// every still-pending request-map entry, in command-id order.
    async fn restore_transport(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        // Tell the broker this client is fault tolerant before anything
        // else is replayed.
        let control = Command::new(CommandBody::ConnectionControl(ConnectionControl {
            fault_tolerant: true,
            ..ConnectionControl::default()
        }));
        transport.oneway(control).await?;

        self.tracker.restore(transport.as_ref()).await?;

        let pending: Vec<Command> = {
            let request_map = self.request_map.lock();
            request_map.values().map(RequestEntry::command).collect()
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "replaying in-flight requests");
        }
        for command in pending {
            transport.oneway(command).await?;
        }
        Ok(())
    }

    /// Bounded wait for an upper listener to appear before completion
    /// events are delivered, re-checking the closed flag each tick.
    async fn await_listener(&self) {
        for _ in 0..20 {
            if self.listener.is_set() || self.closed.load(Ordering::Acquire) {
                return;
            }
            let _ = tokio::time::timeout(POLL, self.listener_notify.notified()).await;
        }
    }

    /// Tops the standby pool up toward its configured size. Runs on every
    /// worker pass so a broker coming back is noticed within one tick even
    /// while the connection is healthy.
    async fn refill_backups(this: &Arc<Self>) {
        if !this.backups.is_enabled() {
            return;
        }
        let (candidates, connected_uri) = {
            let state = this.state.lock();
            (
                state.active_pool_ref(this.config.update_uris_supported).uri_list(),
                state.connected_uri.clone(),
            )
        };
        let candidates: Vec<BrokerUri> = candidates
            .into_iter()
            .filter(|uri| Some(uri) != connected_uri.as_ref())
            .collect();
        // A standby must never point at the currently connected URI.
        if let Some(connected) = &connected_uri {
            this.backups.evict(connected).await;
        }
        let factory = InnerFactory { inner: Arc::downgrade(this) };
        let priority_view = this.state.lock().clone_priority_view(&this.config);
        this.backups
            .refill(&candidates, &factory, |uri| priority_view.contains(uri))
            .await;
    }

    /// One reconnect pass; the return value is "more work to do".
    async fn reconnect_iterate(self: Arc<Self>) -> bool {
        if self.is_closed_or_failed() {
            self.reconnect_notify.notify_waiters();
            return false;
        }
        Self::refill_backups(&self).await;
        if self.is_connection_state_valid() {
            return false;
        }

        // Rebalance: drop a healthy connection in favour of the preferred
        // URI, unless we are already on it.
        let interrupted = {
            let mut state = self.state.lock();
            let mut interrupted = false;
            if state.do_rebalance {
                state.do_rebalance = false;
                let on_preferred = state.connected_to_priority || {
                    let preferred =
                        state.active_pool_ref(self.config.update_uris_supported).priority_uri();
                    preferred.is_some() && state.connected_uri.as_ref() == preferred
                };
                if on_preferred {
                    return false;
                }
                interrupted = self.disconnect_locked(&mut state);
            }
            self.reset_reconnect_delay(&mut state);
            interrupted
        };
        if interrupted {
            self.notify_interrupted();
        }

        // Adopt a standby before dialing anything new. A priority standby
        // justifies dropping a healthy non-priority connection.
        let mut candidate: Option<(Arc<dyn Transport>, BrokerUri, bool)> = None;
        if self.backups.is_enabled() {
            let wants_priority_switch = {
                let state = self.state.lock();
                self.config.priority_backup
                    && !state.connected_to_priority
                    && self.backups.is_priority_backup_available()
            };
            let connected = self.state.lock().connected_transport.is_some();
            if wants_priority_switch || !connected {
                if let Some(backup) = self.backups.take_backup() {
                    let interrupted = {
                        let mut state = self.state.lock();
                        self.disconnect_locked(&mut state)
                    };
                    if interrupted {
                        self.notify_interrupted();
                    }
                    debug!(uri = %backup.uri, priority = backup.priority, "adopting backup transport");
                    candidate = Some((backup.transport, backup.uri, true));
                }
            }
        }

        let had_backup = candidate.is_some();
        let mut failures: Vec<BrokerUri> = Vec::new();
        let mut last_error: Option<TransportError> = None;

        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }

            let (transport, uri, already_started) = match candidate.take() {
                Some(next) => next,
                None => {
                    // Pick the next candidate URI, skipping exhausted ones.
                    let picked = {
                        let mut state = self.state.lock();
                        if state.connected_transport.is_some() {
                            break;
                        }
                        let limit = self.reconnect_attempt_limit(&state);
                        let first_connection = state.first_connection;
                        let updates = self.config.update_uris_supported;
                        loop {
                            let Some(uri) = state.active_pool(updates).take_next() else {
                                break None;
                            };
                            if !first_connection && state.is_uri_exhausted(&uri, limit) {
                                trace!(uri = %uri, "skipping exhausted URI");
                                failures.push(uri);
                                continue;
                            }
                            break Some(uri);
                        }
                    };
                    let Some(uri) = picked else { break };

                    match self.create_transport(&uri) {
                        Ok(transport) => (transport, uri, false),
                        Err(create_error) => {
                            warn!(uri = %uri, error = %create_error, "cannot build transport");
                            self.state.lock().record_uri_failure(&uri);
                            failures.push(uri);
                            last_error = Some(create_error);
                            continue;
                        }
                    }
                }
            };

            transport.set_listener(self.my_listener());
            let aborted = {
                let mut state = self.state.lock();
                if self.closed.load(Ordering::Acquire) {
                    true
                } else {
                    state.connecting = Some(transport.clone());
                    false
                }
            };
            if aborted {
                let _ = transport.close().await;
                return false;
            }

            let attempt = async {
                if !already_started {
                    debug!(uri = %uri, attempt = self.state.lock().uri_failure_count(&uri) + 1,
                        "attempting connection");
                    transport.start().await?;
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(TransportError::closed());
                }
                let restore_needed = {
                    let state = self.state.lock();
                    self.started.load(Ordering::Acquire) && !state.first_connection
                };
                if restore_needed {
                    self.restore_transport(&transport).await?;
                }
                Ok(())
            }
            .await;

            self.state.lock().connecting = None;

            match attempt {
                Ok(()) => {
                    let published = {
                        let mut state = self.state.lock();
                        if self.closed.load(Ordering::Acquire) {
                            false
                        } else {
                            state.reconnect_delay = self.config.initial_reconnect_delay;
                            state.connected_uri = Some(uri.clone());
                            state.connected_transport = Some(transport.clone());
                            state.connect_failures = 0;
                            state.uri_failure_counts.clear();
                            state.connected_to_priority = self.config.priority_backup
                                && self.is_priority_uri(&state, &uri);
                            state.first_connection = false;

                            // Give the failed candidates back for future passes.
                            let updates = self.config.update_uris_supported;
                            for failed in failures.drain(..) {
                                state.active_pool(updates).return_uri(&failed);
                            }
                            true
                        }
                    };
                    if !published {
                        let _ = transport.close().await;
                        return false;
                    }
                    info!(uri = %uri, "connected");

                    // Publish before notifying so isConnected() observers
                    // agree with the resumed callback.
                    self.connected.store(true, Ordering::Release);
                    self.reconnect_notify.notify_waiters();

                    self.await_listener().await;
                    if let Some(listener) = self.listener.current() {
                        listener.transport_resumed();
                    }
                    return false;
                }
                Err(attempt_error) => {
                    debug!(uri = %uri, error = %attempt_error, "connection attempt failed");
                    transport.set_listener(Arc::new(DisposedListener));
                    self.connected.store(false, Ordering::Release);
                    self.close_task.add(transport);

                    let count = self.state.lock().record_uri_failure(&uri);
                    trace!(uri = %uri, count, "URI failure recorded");
                    failures.push(uri);
                    last_error = Some(attempt_error);
                }
            }
        }

        // Pass over; hand candidates back and decide whether we are done.
        let verdict = {
            let mut state = self.state.lock();
            let updates = self.config.update_uris_supported;
            for failed in failures.drain(..) {
                state.active_pool(updates).return_uri(&failed);
            }
            if state.connected_transport.is_some() {
                return false;
            }

            let limit = self.reconnect_attempt_limit(&state);
            state.connect_failures += 1;

            let pool_empty =
                state.active_pool_ref(self.config.update_uris_supported).is_empty()
                    && !self.backups.is_enabled();
            let all_exhausted =
                state.all_uris_exhausted(self.config.update_uris_supported, limit);

            if pool_empty || all_exhausted {
                let failure = last_error
                    .take()
                    .unwrap_or_else(|| {
                        TransportError::ConnectionFailed(
                            "no URIs available for reconnect".to_string(),
                        )
                    });
                error!(limit, "reconnection attempts exhausted for every URI");
                state.connection_failure = Some(failure);

                let was_first = state.first_connection;
                let transitioning = was_first
                    && self.config.startup_max_reconnect_attempts
                        != self.config.max_reconnect_attempts;
                if was_first {
                    // Leave the startup phase: steady-state caps and a fresh
                    // delay apply from here on.
                    info!("transitioning from startup to steady-state reconnect limits");
                    state.first_connection = false;
                    state.connect_failures = 0;
                    state.uri_failure_counts.clear();
                    state.reconnect_delay = self.config.initial_reconnect_delay;
                }
                Some(transitioning)
            } else {
                None
            }
        };

        if let Some(transitioning) = verdict {
            self.await_listener().await;
            self.propagate_failure_to_listener();
            if transitioning {
                // The steady-state cap differs; clear the latch and retry
                // immediately, without sleeping.
                self.state.lock().connection_failure = None;
                return true;
            }
            return false;
        }

        if !self.closed.load(Ordering::Acquire) && !had_backup {
            self.do_delay().await;
        }
        !self.closed.load(Ordering::Acquire)
    }

    /// Backoff sleep between passes; interruptible by close, grows the delay
    /// geometrically up to the configured ceiling.
    async fn do_delay(&self) {
        let delay = self.state.lock().reconnect_delay;
        if delay > Duration::ZERO {
            trace!(?delay, "sleeping before next reconnect pass");
            let _ = tokio::time::timeout(delay, self.sleep_notify.notified()).await;
        }
        if self.config.use_exponential_backoff {
            let mut state = self.state.lock();
            state.reconnect_delay = (state.reconnect_delay
                * self.config.backoff_multiplier)
                .min(self.config.max_reconnect_delay);
        }
    }
}

impl ReconnectState {
    /// Snapshot of the URIs considered priority right now, for the backup
    /// refill closure which must not touch the state lock.
    fn clone_priority_view(&self, config: &FailoverConfig) -> Vec<BrokerUri> {
        let mut priority: Vec<BrokerUri> = config.priority_uris.clone();
        if let Some(head) =
            self.active_pool_ref(config.update_uris_supported).priority_uri()
        {
            if !priority.contains(head) {
                priority.push(head.clone());
            }
        }
        priority
    }
}

/// Transport factory handed to the backup pool.
struct InnerFactory {
    inner: Weak<FailoverInner>,
}

impl PhysicalTransportFactory for InnerFactory {
    fn create(&self, uri: &BrokerUri) -> Result<Arc<dyn Transport>> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(TransportError::closed)?;
        inner.create_transport(uri)
    }
}

/// The listener installed on every physical transport stack.
struct InnerListener {
    inner: Weak<FailoverInner>,
}

impl TransportListener for InnerListener {
    fn on_command(&self, command: Command) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(correlation_id) = command.correlation_id() {
            inner.process_response(correlation_id);
        }
        if let CommandBody::ConnectionControl(control) = &command.body {
            inner.handle_connection_control(control);
        }
        if let Some(listener) = inner.listener.current() {
            listener.on_command(command);
        }
    }

    fn on_exception(&self, error: TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_transport_failure(&error);
        }
    }
}

/// The reconnect iteration as a cooperative task on the shared worker.
struct ReconnectTask {
    inner: Weak<FailoverInner>,
}

#[async_trait]
impl CompositeTask for ReconnectTask {
    async fn iterate(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.reconnect_iterate().await,
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.started.load(Ordering::Acquire)
                    && !inner.is_closed_or_failed()
                    && !inner.is_connection_state_valid()
            }
            None => false,
        }
    }
}

/// Fault-tolerant virtual transport over a pool of broker URIs.
pub struct FailoverTransport {
    inner: Arc<FailoverInner>,
}

impl FailoverTransport {
    /// Builds a transport from a parsed `failover:(…)` URI.
    pub fn new(failover_uri: FailoverUri) -> Self {
        let FailoverUri { uris, config, transport_params } = failover_uri;

        let tracker = ConnectionStateTracker::new(TrackerConfig {
            track_messages: config.track_messages,
            track_transaction_producers: config.track_transaction_producers,
            max_cache_size: config.max_cache_size,
            max_pull_cache_size: config.max_pull_cache_size,
        });

        let inner = Arc::new(FailoverInner {
            backups: BackupTransportPool::new(config.backup_pool_size),
            state: Mutex::new(ReconnectState {
                uris: UriPool::with_uris(uris, config.randomize),
                updated: UriPool::new(config.randomize),
                connected_transport: None,
                connected_uri: None,
                connecting: None,
                connection_failure: None,
                do_rebalance: false,
                first_connection: true,
                connect_failures: 0,
                reconnect_delay: config.initial_reconnect_delay,
                uri_failure_counts: HashMap::new(),
                connected_to_priority: false,
            }),
            transport_params,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown_sent: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
            sleep_notify: Notify::new(),
            listener: ListenerSlot::empty(),
            listener_notify: Notify::new(),
            request_map: Mutex::new(BTreeMap::new()),
            tracker,
            sequence: CommandIdSequence::new(),
            close_task: Arc::new(CloseTransportsTask::new()),
            task_runner: CompositeTaskRunner::new(),
            config,
            my_listener: Mutex::new(None),
        });

        *inner.my_listener.lock() =
            Some(Arc::new(InnerListener { inner: Arc::downgrade(&inner) }) as Arc<dyn TransportListener>);
        inner
            .task_runner
            .add_task(Arc::new(ReconnectTask { inner: Arc::downgrade(&inner) }));
        inner.task_runner.add_task(inner.close_task.clone());

        Self { inner }
    }

    /// Parses and builds in one step.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(FailoverUri::parse(uri)?))
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.inner.config
    }

    /// Adds a candidate URI; a change requests a reconnect (optionally a
    /// rebalancing one).
    pub fn add_uri(&self, rebalance: bool, uri: BrokerUri) {
        if self.inner.state.lock().uris.add(uri) {
            self.inner.request_reconnect(rebalance);
        }
    }

    pub fn add_uris(&self, rebalance: bool, uris: &[BrokerUri]) {
        if self.inner.state.lock().uris.add_all(uris) {
            self.inner.request_reconnect(rebalance);
        }
    }

    pub fn remove_uris(&self, rebalance: bool, uris: &[BrokerUri]) {
        if self.inner.state.lock().uris.remove_all(uris) {
            self.inner.request_reconnect(rebalance);
        }
    }

    /// Replaces the broker-advertised URI pool, as a ConnectionControl with
    /// a `connectedBrokers` list would.
    pub fn update_uris(&self, rebalance: bool, uris: &[BrokerUri]) {
        self.inner.update_uris(rebalance, uris);
    }

    /// The upper layer finished its interrupt cleanup for a connection.
    pub fn connection_interrupt_processing_complete(&self, connection_id: &ConnectionId) {
        self.inner.tracker.connection_interrupt_processing_complete(connection_id);
    }

    pub fn is_connected_to_priority(&self) -> bool {
        self.inner.state.lock().connected_to_priority
    }

    /// Pauses reconnection without tearing state down; `start()` resumes.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);
        self.inner.backups.set_enabled(false);
        self.inner.reconnect_notify.notify_waiters();
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.request_map.lock().len()
    }

    /// Delivers a synthetic command through the same path a broker command
    /// would take.
    fn deliver_inbound(&self, command: Command) {
        self.inner.my_listener().on_command(command);
    }

    /// Waits until a transport is available, honouring the send timeout for
    /// messages, and mapping every exit condition to its specific error.
    async fn wait_for_transport(&self, command: &Command) -> Result<Arc<dyn Transport>> {
        let inner = &self.inner;
        let started_waiting = Instant::now();
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(TransportError::closed());
            }
            {
                let state = inner.state.lock();
                if let Some(transport) = &state.connected_transport {
                    return Ok(transport.clone());
                }
                if let Some(failure) = &state.connection_failure {
                    return Err(failure.duplicate());
                }
            }
            if !inner.will_reconnect() {
                return Err(TransportError::ConnectionFailed(
                    "maximum reconnection attempts exceeded".to_string(),
                ));
            }
            if command.is_message()
                && inner.config.timeout > Duration::ZERO
                && started_waiting.elapsed() > inner.config.timeout
            {
                return Err(TransportError::Timeout(format!(
                    "failover timeout of {} ms reached",
                    inner.config.timeout.as_millis()
                )));
            }
            let _ = tokio::time::timeout(POLL, inner.reconnect_notify.notified()).await;
        }
    }

    /// Handles the commands that can be completed locally while no broker is
    /// reachable. Returns true when the command was fully handled.
    fn absorb_while_disconnected(&self, command: &mut Command) -> bool {
        let inner = &self.inner;
        if inner.state.lock().connected_transport.is_some() {
            return false;
        }

        if command.is_shutdown_info() {
            // Nothing to shut down; drop it silently.
            return true;
        }

        if command.is_remove_info() || command.is_message_ack() {
            // Track so replay won't recreate what the caller tore down, and
            // fake the broker's acknowledgement: the real one would be stale
            // by the time we reconnect.
            inner.tracker.track(command);
            if command.response_required {
                inner.sequence.assign(command);
                self.deliver_inbound(Command::new(CommandBody::Response(Response {
                    correlation_id: command.command_id,
                })));
            }
            return true;
        }

        if let CommandBody::MessagePull(pull) = &command.body {
            if pull.timeout != 0 {
                // A timed pull cannot be honoured now; complete it with an
                // empty dispatch so the consumer does not hang.
                self.deliver_inbound(Command::new(CommandBody::MessageDispatch(
                    MessageDispatch {
                        consumer_id: pull.consumer_id.clone(),
                        destination: pull.destination.clone(),
                        message: None,
                        redelivery_counter: 0,
                    },
                )));
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed());
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting failover transport");

        if inner.config.backups_enabled || inner.config.priority_backup {
            inner.backups.set_enabled(true);
        }
        inner.task_runner.start();
        inner.task_runner.wakeup();
        Ok(())
    }

    async fn oneway(&self, mut command: Command) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed());
        }

        if self.absorb_while_disconnected(&mut command) {
            return Ok(());
        }

        // Keep trying until the command is on the wire or a terminal
        // condition surfaces.
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(TransportError::closed());
            }

            let transport = self.wait_for_transport(&command).await?;

            // Ids are assigned before parking so the request map has its
            // key, and never reassigned on retry.
            if command.response_required {
                inner.sequence.assign(&mut command);
            }

            let tracked = inner.tracker.track(&command);
            let was_tracked = tracked.is_some();
            match tracked {
                Some(tracked) if tracked.is_waiting_for_response() => {
                    inner
                        .request_map
                        .lock()
                        .insert(command.command_id, RequestEntry::Tracked(Arc::new(tracked)));
                }
                None if command.response_required => {
                    inner
                        .request_map
                        .lock()
                        .insert(command.command_id, RequestEntry::Plain(command.clone()));
                }
                _ => {}
            }

            match transport.oneway(command.clone()).await {
                Ok(()) => {
                    if command.is_shutdown_info() {
                        inner.shutdown_sent.store(true, Ordering::Release);
                    }
                    return Ok(());
                }
                Err(send_error) => {
                    debug!(id = command.command_id, error = %send_error, "send failed");
                    let retry_here = {
                        let state = inner.state.lock();
                        !was_tracked && inner.can_reconnect(&state)
                    };
                    if retry_here {
                        // We will retry in this loop; pull it out of the
                        // request map so recovery does not send it twice.
                        if command.response_required {
                            inner.request_map.lock().remove(&command.command_id);
                        }
                        inner.handle_transport_failure(&send_error);
                        continue;
                    }
                    // Tracked commands are replayed by the reconnect path;
                    // trigger it, since we cannot count on socket events to
                    // trip the failover condition.
                    inner.handle_transport_failure(&send_error);
                    return Ok(());
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let transport_to_stop = {
            let mut state = inner.state.lock();
            if inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            info!("closing failover transport");
            inner.started.store(false, Ordering::Release);
            inner.connected.store(false, Ordering::Release);
            state
                .connected_transport
                .take()
                .or_else(|| state.connecting.take())
        };

        inner.backups.close().await;
        inner.request_map.lock().clear();

        // Wake every parked waiter so they observe the closed flag.
        inner.sleep_notify.notify_waiters();
        inner.reconnect_notify.notify_waiters();
        inner.listener_notify.notify_waiters();

        // Close the transport before stopping the worker so any blocking
        // operation inside an iterate is interrupted first.
        if let Some(transport) = transport_to_stop {
            transport.set_listener(Arc::new(DisposedListener));
            let _ = transport.close().await;
        }

        inner
            .task_runner
            .shutdown(Duration::from_secs(crate::defaults::TASK_RUNNER_SHUTDOWN_SECS))
            .await;
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        // Bounded acquisition: a teardown racing this call must not park the
        // caller indefinitely.
        self.inner
            .listener
            .set_with_retries(listener, 50, Duration::from_millis(50));
        self.inner.listener_notify.notify_waiters();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn is_fault_tolerant(&self) -> bool {
        true
    }

    fn remote_address(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .connected_transport
            .as_ref()
            .and_then(|transport| transport.remote_address())
    }

    fn wire_format(&self) -> Option<crate::wire::WireFormat> {
        let transport = self.inner.state.lock().connected_transport.clone();
        transport.and_then(|t| t.wire_format())
    }
}

impl Drop for FailoverTransport {
    fn drop(&mut self) {
        // Best-effort latch so stray tasks observe the closed flag even if
        // the owner forgot to close().
        self.inner.closed.store(true, Ordering::Release);
        self.inner.started.store(false, Ordering::Release);
        self.inner.reconnect_notify.notify_waiters();
        self.inner.sleep_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ConsumerId, Destination, MessagePull, RemoveInfo, RemoveTarget,
        SessionId};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct CollectingListener {
        commands: mpsc::UnboundedSender<Command>,
        exceptions: Arc<AtomicUsize>,
        interruptions: Arc<AtomicUsize>,
        resumptions: Arc<AtomicUsize>,
    }

    impl TransportListener for CollectingListener {
        fn on_command(&self, command: Command) {
            let _ = self.commands.send(command);
        }
        fn on_exception(&self, _error: TransportError) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
        fn transport_interrupted(&self) {
            self.interruptions.fetch_add(1, Ordering::SeqCst);
        }
        fn transport_resumed(&self) {
            self.resumptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn listener() -> (
        Arc<CollectingListener>,
        mpsc::UnboundedReceiver<Command>,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let exceptions = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(CollectingListener {
            commands: tx,
            exceptions: exceptions.clone(),
            interruptions: Arc::new(AtomicUsize::new(0)),
            resumptions: Arc::new(AtomicUsize::new(0)),
        });
        (listener, rx, exceptions)
    }

    #[tokio::test]
    async fn shutdown_info_is_dropped_while_disconnected() {
        let transport =
            FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)?maxReconnectAttempts=0")
                .unwrap();
        transport
            .oneway(Command::new(CommandBody::ShutdownInfo))
            .await
            .expect("shutdown is silently dropped");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_info_gets_a_synthetic_response_while_disconnected() {
        let transport =
            FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)?maxReconnectAttempts=0")
                .unwrap();
        let (upper, mut commands, _) = listener();
        transport.set_listener(upper);

        let connection = ConnectionId::new("ID:x-1");
        let session = SessionId::new(&connection, 1);
        let remove = Command::request(CommandBody::RemoveInfo(RemoveInfo {
            target: RemoveTarget::Session(session),
            last_delivered_sequence_id: 0,
        }));
        transport.oneway(remove).await.unwrap();

        let answer = commands.recv().await.expect("synthetic response");
        assert!(answer.correlation_id().is_some());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn timed_pull_is_completed_locally_while_disconnected() {
        let transport =
            FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)?maxReconnectAttempts=0")
                .unwrap();
        let (upper, mut commands, _) = listener();
        transport.set_listener(upper);

        let connection = ConnectionId::new("ID:x-1");
        let session = SessionId::new(&connection, 1);
        let pull = Command::new(CommandBody::MessagePull(MessagePull {
            consumer_id: ConsumerId::new(&session, 4),
            destination: Destination::queue("Q"),
            timeout: 1000,
        }));
        transport.oneway(pull).await.unwrap();

        match commands.recv().await.expect("empty dispatch").body {
            CommandBody::MessageDispatch(dispatch) => {
                assert!(dispatch.message.is_none());
                assert_eq!(dispatch.consumer_id.value, 4);
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_failure_latches_and_fails_fast() {
        // Nothing listens on this port; three quick attempts then terminal.
        let transport = FailoverTransport::from_uri(
            "failover:(tcp://127.0.0.1:61999)?maxReconnectAttempts=3&initialReconnectDelay=5&\
             useExponentialBackOff=false&startupMaxReconnectAttempts=3&randomize=false&\
             timeout=5000",
        )
        .unwrap();
        let (upper, _commands, exceptions) = listener();
        transport.set_listener(upper);
        transport.start().await.unwrap();

        let probe = Command::new(CommandBody::KeepAliveInfo);
        let error = transport.oneway(probe).await.expect_err("must surface terminal failure");
        assert!(
            matches!(
                error,
                TransportError::Io(_)
                    | TransportError::ConnectionFailed(_)
                    | TransportError::Timeout(_)
            ),
            "unexpected error {error:?}"
        );

        // Latched: the next send fails immediately.
        let started = Instant::now();
        let again = transport.oneway(Command::new(CommandBody::KeepAliveInfo)).await;
        assert!(again.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(exceptions.load(Ordering::SeqCst) >= 1, "failure propagated to listener");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fast_the_second_time() {
        let transport =
            FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)").unwrap();
        transport.start().await.unwrap();
        transport.close().await.unwrap();

        let started = Instant::now();
        transport.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(transport.is_closed());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_configuration_error() {
        let parsed = FailoverUri::parse("failover:(ssl://127.0.0.1:61617)").unwrap();
        let transport = FailoverTransport::new(parsed);
        let error = transport
            .inner
            .create_transport(&BrokerUri::parse("ssl://127.0.0.1:61617").unwrap())
            .unwrap_err();
        assert!(matches!(error, TransportError::Configuration(_)));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn fault_tolerance_is_reported() {
        let transport = FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)").unwrap();
        assert!(transport.is_fault_tolerant());
        assert!(transport.remote_address().is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_paths_are_unsupported_on_the_failover_layer() {
        let transport = FailoverTransport::from_uri("failover:(tcp://127.0.0.1:1)").unwrap();

        let error = transport
            .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::Unsupported(_)));

        let error = transport
            .async_request(
                Command::new(CommandBody::KeepAliveInfo),
                Duration::from_millis(10),
                Box::new(|_| {}),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::Unsupported(_)));

        transport.close().await.unwrap();
    }
}
