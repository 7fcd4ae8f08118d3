//! # Backup Transport Pool
//!
//! Optionally holds hot standby transports, pre-connected to pool URIs, so
//! that failover can hand off to a live socket instead of dialing from
//! scratch. The reconnect worker tops the pool up on each pass; a backup
//! that fails while parked removes itself. Priority URIs are preferred when
//! `priority_backup` is configured, and the availability of a priority
//! backup is what triggers the voluntary disconnect from a non-priority
//! broker.

use crate::error::Result;
use crate::furi::BrokerUri;
use crate::transport::{Transport, TransportListener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Creates started physical transports for the failover layer and the
/// backup pool.
#[async_trait]
pub trait PhysicalTransportFactory: Send + Sync {
    /// Builds a transport for `uri` without starting it.
    fn create(&self, uri: &BrokerUri) -> Result<Arc<dyn Transport>>;
}

/// One parked standby transport.
#[derive(Clone)]
pub struct BackupTransport {
    pub uri: BrokerUri,
    pub priority: bool,
    pub transport: Arc<dyn Transport>,
}

struct PoolShared {
    backups: Mutex<Vec<BackupTransport>>,
    enabled: AtomicBool,
    closed: AtomicBool,
}

impl PoolShared {
    fn remove(&self, uri: &BrokerUri) -> Option<BackupTransport> {
        let mut backups = self.backups.lock();
        backups
            .iter()
            .position(|b| b.uri == *uri)
            .map(|index| backups.remove(index))
    }
}

/// Listener parked on each standby; a failure while parked evicts it.
struct BackupWatch {
    pool: Weak<PoolShared>,
    uri: BrokerUri,
}

impl TransportListener for BackupWatch {
    fn on_command(&self, _command: crate::commands::Command) {
        // Standbys have nothing to deliver; keep-alives are absorbed below.
    }

    fn on_exception(&self, _error: crate::error::TransportError) {
        if let Some(pool) = self.pool.upgrade() {
            if let Some(dead) = pool.remove(&self.uri) {
                debug!(uri = %self.uri, "backup transport failed while parked");
                // Close on a detached task: we are on the dead transport's
                // reader here.
                tokio::spawn(async move {
                    let _ = dead.transport.close().await;
                });
            }
        }
    }
}

/// Pool of pre-connected standby transports.
pub struct BackupTransportPool {
    shared: Arc<PoolShared>,
    pool_size: usize,
}

impl BackupTransportPool {
    pub fn new(pool_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                backups: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            pool_size,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
            && !self.shared.closed.load(Ordering::Acquire)
    }

    pub fn backup_count(&self) -> usize {
        self.shared.backups.lock().len()
    }

    pub fn contains(&self, uri: &BrokerUri) -> bool {
        self.shared.backups.lock().iter().any(|b| b.uri == *uri)
    }

    /// True when a standby to a priority URI is parked and ready.
    pub fn is_priority_backup_available(&self) -> bool {
        self.is_enabled() && self.shared.backups.lock().iter().any(|b| b.priority)
    }

    /// Hands out the best available standby: priority entries first.
    pub fn take_backup(&self) -> Option<BackupTransport> {
        let mut backups = self.shared.backups.lock();
        if backups.is_empty() {
            return None;
        }
        let index = backups.iter().position(|b| b.priority).unwrap_or(0);
        Some(backups.remove(index))
    }

    /// Tops the pool up toward its configured size from `candidates`
    /// (already filtered to exclude the connected URI). Connect failures are
    /// skipped quietly; the next pass retries.
    pub async fn refill<P>(
        &self,
        candidates: &[BrokerUri],
        factory: &dyn PhysicalTransportFactory,
        is_priority: P,
    ) where
        P: Fn(&BrokerUri) -> bool,
    {
        if !self.is_enabled() {
            return;
        }

        // Priority candidates first so the pool prefers them when capacity
        // is tight.
        let mut ordered: Vec<&BrokerUri> = candidates.iter().collect();
        ordered.sort_by_key(|uri| !is_priority(uri));

        for uri in ordered {
            if self.contains(uri) || self.shared.closed.load(Ordering::Acquire) {
                continue;
            }
            if self.backup_count() >= self.pool_size {
                // A priority URI may displace a parked non-priority standby.
                let displaced = if is_priority(uri) && !self.is_priority_backup_available() {
                    let backups = self.shared.backups.lock();
                    backups.iter().find(|b| !b.priority).map(|b| b.uri.clone())
                } else {
                    None
                };
                match displaced {
                    Some(victim) => self.evict(&victim).await,
                    None => break,
                }
            }

            let transport = match factory.create(uri) {
                Ok(transport) => transport,
                Err(error) => {
                    trace!(uri = %uri, %error, "backup create failed");
                    continue;
                }
            };
            transport.set_listener(Arc::new(BackupWatch {
                pool: Arc::downgrade(&self.shared),
                uri: uri.clone(),
            }));
            match transport.start().await {
                Ok(()) => {
                    debug!(uri = %uri, "backup transport parked");
                    self.shared.backups.lock().push(BackupTransport {
                        uri: uri.clone(),
                        priority: is_priority(uri),
                        transport,
                    });
                }
                Err(error) => {
                    trace!(uri = %uri, %error, "backup connect failed");
                    let _ = transport.close().await;
                }
            }
        }
    }

    /// Drops a parked standby for `uri`, closing it.
    pub async fn evict(&self, uri: &BrokerUri) {
        if let Some(backup) = self.shared.remove(uri) {
            let _ = backup.transport.close().await;
        }
    }

    /// Closes every parked standby and refuses further refills.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.enabled.store(false, Ordering::Release);
        let drained: Vec<BackupTransport> =
            std::mem::take(&mut *self.shared.backups.lock());
        for backup in drained {
            let _ = backup.transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::error::TransportError;
    use crate::transport::ListenerSlot;

    struct StubTransport {
        listener: ListenerSlot,
        started: AtomicBool,
        closed: AtomicBool,
        refuse_start: bool,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn start(&self) -> Result<()> {
            if self.refuse_start {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn oneway(&self, _command: Command) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn set_listener(&self, listener: Arc<dyn TransportListener>) {
            self.listener.set(listener);
        }
        fn is_connected(&self) -> bool {
            self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct StubFactory {
        refuse: Vec<BrokerUri>,
        created: Mutex<Vec<Arc<StubTransport>>>,
    }

    impl PhysicalTransportFactory for StubFactory {
        fn create(&self, uri: &BrokerUri) -> Result<Arc<dyn Transport>> {
            let transport = Arc::new(StubTransport {
                listener: ListenerSlot::empty(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                refuse_start: self.refuse.contains(uri),
            });
            self.created.lock().push(transport.clone());
            Ok(transport)
        }
    }

    fn uri(port: u16) -> BrokerUri {
        BrokerUri::parse(&format!("tcp://127.0.0.1:{port}")).unwrap()
    }

    #[tokio::test]
    async fn refill_parks_up_to_pool_size() {
        let pool = BackupTransportPool::new(2);
        pool.set_enabled(true);
        let factory = StubFactory { refuse: vec![], created: Mutex::new(Vec::new()) };

        pool.refill(&[uri(1), uri(2), uri(3)], &factory, |_| false).await;
        assert_eq!(pool.backup_count(), 2);
        assert!(pool.contains(&uri(1)));
        assert!(pool.contains(&uri(2)));
        assert!(!pool.contains(&uri(3)));
    }

    #[tokio::test]
    async fn priority_candidates_fill_first_and_are_preferred() {
        let pool = BackupTransportPool::new(1);
        pool.set_enabled(true);
        let factory = StubFactory { refuse: vec![], created: Mutex::new(Vec::new()) };

        pool.refill(&[uri(1), uri(2)], &factory, |u| *u == uri(2)).await;
        assert_eq!(pool.backup_count(), 1);
        assert!(pool.is_priority_backup_available());

        let taken = pool.take_backup().unwrap();
        assert_eq!(taken.uri, uri(2));
        assert!(taken.priority);
        assert!(!pool.is_priority_backup_available());
    }

    #[tokio::test]
    async fn connect_failures_are_skipped() {
        let pool = BackupTransportPool::new(2);
        pool.set_enabled(true);
        let factory =
            StubFactory { refuse: vec![uri(1)], created: Mutex::new(Vec::new()) };

        pool.refill(&[uri(1), uri(2)], &factory, |_| false).await;
        assert_eq!(pool.backup_count(), 1);
        assert!(pool.contains(&uri(2)));
    }

    #[tokio::test]
    async fn parked_failure_evicts_the_backup() {
        let pool = BackupTransportPool::new(1);
        pool.set_enabled(true);
        let factory = StubFactory { refuse: vec![], created: Mutex::new(Vec::new()) };
        pool.refill(&[uri(1)], &factory, |_| false).await;
        assert_eq!(pool.backup_count(), 1);

        let parked = factory.created.lock()[0].clone();
        parked.listener.current().unwrap().on_exception(TransportError::Io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        ));
        assert_eq!(pool.backup_count(), 0);
    }

    #[tokio::test]
    async fn close_drains_and_disables() {
        let pool = BackupTransportPool::new(2);
        pool.set_enabled(true);
        let factory = StubFactory { refuse: vec![], created: Mutex::new(Vec::new()) };
        pool.refill(&[uri(1), uri(2)], &factory, |_| false).await;

        pool.close().await;
        assert_eq!(pool.backup_count(), 0);
        assert!(!pool.is_enabled());
        for transport in factory.created.lock().iter() {
            assert!(transport.is_closed());
        }
    }
}
