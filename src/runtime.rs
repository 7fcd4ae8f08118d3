//! # Shared I/O Runtime
//!
//! A process-wide executor that drives every socket owned by the library.
//! The first transport to open a socket starts it lazily; `stop()` drains it
//! in the background; a transport created after a stop restarts it from a
//! clean state.
//!
//! Worker threads are sized `min(max(2, cores), 8)` and carry no state of
//! their own, so cancelling the tasks of one socket never affects another.
//! Individual transports hold only buffers; the runtime is the sole owner of
//! the worker threads.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

static STATE: Mutex<RuntimeState> = Mutex::new(RuntimeState {
    runtime: None,
    generation: 0,
    acquisitions: 0,
});
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

struct RuntimeState {
    runtime: Option<Runtime>,
    /// Bumped on every fresh start so stale guards can be told apart.
    generation: u64,
    /// Live acquisition count, kept for diagnostics; the runtime is only
    /// stopped explicitly, never by the count reaching zero.
    acquisitions: usize,
}

/// Number of worker threads the runtime starts with.
pub fn worker_threads() -> usize {
    num_cpus::get().max(2).min(8)
}

/// An acquired reference to the shared runtime. Cheap to clone the inner
/// handle; dropping releases the acquisition count.
pub struct IoRuntimeGuard {
    handle: Handle,
    generation: u64,
}

impl IoRuntimeGuard {
    /// Spawns a future onto the shared runtime. Tasks submitted before a
    /// `stop()` either run to completion or observe cancellation through
    /// their I/O resources being closed.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for IoRuntimeGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock();
        if state.generation == self.generation && state.acquisitions > 0 {
            state.acquisitions -= 1;
        }
    }
}

/// Acquires the shared runtime, starting it if necessary (including after a
/// previous `stop()`).
pub fn acquire() -> IoRuntimeGuard {
    let mut state = STATE.lock();
    if state.runtime.is_none() {
        let threads = worker_threads();
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("openwire-io")
            .enable_all()
            .build()
            .expect("failed to build the shared I/O runtime");
        state.runtime = Some(runtime);
        state.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        state.acquisitions = 0;
        info!(threads, "shared I/O runtime started");
    }
    state.acquisitions += 1;
    IoRuntimeGuard {
        handle: state.runtime.as_ref().expect("just started").handle().clone(),
        generation: state.generation,
    }
}

/// Stops the shared runtime. Outstanding tasks are cancelled in the
/// background; the runtime restarts cleanly on the next [`acquire`].
pub fn stop() {
    let runtime = {
        let mut state = STATE.lock();
        state.acquisitions = 0;
        state.runtime.take()
    };
    if let Some(runtime) = runtime {
        debug!("shared I/O runtime stopping");
        // Background shutdown: safe to call from within an async context,
        // worker threads exit once their current poll completes.
        runtime.shutdown_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn worker_count_is_bounded() {
        let threads = worker_threads();
        assert!((2..=8).contains(&threads));
    }

    #[test]
    fn starts_lazily_and_runs_tasks() {
        let guard = acquire();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = guard.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        // Join from outside the runtime.
        while !task.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn restarts_after_stop() {
        let first = acquire();
        drop(first);
        stop();

        let second = acquire();
        let task = second.spawn(async { 21 * 2 });
        let mut result = None;
        for _ in 0..200 {
            if task.is_finished() {
                result = Some(());
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(result.is_some(), "task on restarted runtime never completed");
    }
}
