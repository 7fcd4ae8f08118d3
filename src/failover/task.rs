//! # Composite Task Runner
//!
//! One worker drives a set of cooperative tasks (the reconnect iteration,
//! the transport disposer) serially: on wakeup it calls `iterate()` on each
//! task and keeps cycling until every task reports idle, then sleeps until
//! the next wakeup.
//!
//! The disposer exists to break a deadlock: `close()` called from inside a
//! listener callback of the transport being closed would wait on that
//! transport's own reader. Handing the transport to the disposer queue lets
//! the callback return first; the actual close happens on the worker.

use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A unit of cooperative work. `iterate` returns true while there is more
/// work to do; the runner keeps calling until every task reports idle.
#[async_trait]
pub trait CompositeTask: Send + Sync {
    async fn iterate(&self) -> bool;

    /// Cheap idle check consulted before sleeping.
    fn is_pending(&self) -> bool;
}

struct RunnerShared {
    tasks: Mutex<Vec<Arc<dyn CompositeTask>>>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// Owns the single worker that serially executes all registered tasks.
pub struct CompositeTaskRunner {
    shared: Arc<RunnerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Keeps the shared runtime acquisition alive while the worker runs.
    io_guard: Mutex<Option<crate::runtime::IoRuntimeGuard>>,
}

impl CompositeTaskRunner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                tasks: Mutex::new(Vec::new()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            io_guard: Mutex::new(None),
        }
    }

    pub fn add_task(&self, task: Arc<dyn CompositeTask>) {
        self.shared.tasks.lock().push(task);
    }

    /// Spawns the worker on the shared I/O runtime. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let io = crate::runtime::acquire();
        let handle = io.spawn(async move {
            debug!("task runner worker started");
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let mut more_work = true;
                while more_work && !shared.shutdown.load(Ordering::Acquire) {
                    more_work = false;
                    let tasks: Vec<Arc<dyn CompositeTask>> = shared.tasks.lock().clone();
                    for task in tasks {
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        if task.iterate().await {
                            more_work = true;
                        }
                    }
                }

                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                // A wakeup that raced the loop above left a stored permit in
                // the Notify, so nothing is lost by parking here.
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(
                        crate::defaults::CLOSE_POLL_INTERVAL_MS,
                    )) => {}
                }
            }
            debug!("task runner worker exited");
        });
        *worker = Some(handle);
        *self.io_guard.lock() = Some(io);
    }

    /// Wakes the worker. A wakeup delivered while the worker is mid-cycle is
    /// retained (single stored permit) rather than lost.
    pub fn wakeup(&self) {
        self.shared.wake.notify_one();
    }

    pub fn is_started(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stops the worker, waiting up to `limit` before abandoning it.
    pub async fn shutdown(&self, limit: Duration) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(limit, handle).await.is_err() {
                warn!("task runner worker did not stop within {limit:?}");
            }
        }
        self.io_guard.lock().take();
    }
}

impl Default for CompositeTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue of transports waiting to be closed off the caller's thread.
pub struct CloseTransportsTask {
    queue: Mutex<VecDeque<Arc<dyn Transport>>>,
}

impl CloseTransportsTask {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    /// Enqueues a transport for asynchronous disposal.
    pub fn add(&self, transport: Arc<dyn Transport>) {
        self.queue.lock().push_back(transport);
    }
}

impl Default for CloseTransportsTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompositeTask for CloseTransportsTask {
    async fn iterate(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(transport) => {
                trace!("disposing transport");
                if let Err(error) = transport.close().await {
                    debug!(%error, "error closing disposed transport");
                }
                !self.queue.lock().is_empty()
            }
            None => false,
        }
    }

    fn is_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::error::Result;
    use crate::transport::TransportListener;
    use std::sync::atomic::AtomicUsize;

    struct CountdownTask {
        remaining: AtomicUsize,
        iterations: AtomicUsize,
    }

    #[async_trait]
    impl CompositeTask for CountdownTask {
        async fn iterate(&self) -> bool {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            let before = self.remaining.load(Ordering::SeqCst);
            if before == 0 {
                return false;
            }
            self.remaining.store(before - 1, Ordering::SeqCst);
            before > 1
        }
        fn is_pending(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }
    }

    struct ClosableStub {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for ClosableStub {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn oneway(&self, _command: Command) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}
        fn is_connected(&self) -> bool {
            false
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn runner_drives_task_until_idle() {
        let runner = CompositeTaskRunner::new();
        let task = Arc::new(CountdownTask {
            remaining: AtomicUsize::new(3),
            iterations: AtomicUsize::new(0),
        });
        runner.add_task(task.clone());
        runner.start();
        runner.wakeup();

        for _ in 0..100 {
            if !task.is_pending() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!task.is_pending());
        assert!(task.iterations.load(Ordering::SeqCst) >= 3);
        runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn disposer_closes_queued_transports() {
        let runner = CompositeTaskRunner::new();
        let disposer = Arc::new(CloseTransportsTask::new());
        runner.add_task(disposer.clone());
        runner.start();

        let a = Arc::new(ClosableStub { closed: AtomicBool::new(false) });
        let b = Arc::new(ClosableStub { closed: AtomicBool::new(false) });
        disposer.add(a.clone());
        disposer.add(b.clone());
        runner.wakeup();

        for _ in 0..100 {
            if a.is_closed() && b.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.is_closed() && b.is_closed());
        runner.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_is_prompt() {
        let runner = CompositeTaskRunner::new();
        runner.start();
        let started = std::time::Instant::now();
        runner.shutdown(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
