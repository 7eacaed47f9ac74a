//! Worker threads for the bounded pools.
//!
//! A worker is spawned with a seed task, runs it, then keeps pulling tasks from the
//! pool's rendezvous channel. Each worker owns one capacity token through its
//! [`Slot`]; the slot hands the token back when the thread ends, including when a
//! task panics.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::task::Task;

/// Returned when the OS refuses to spawn a worker thread. Carries the seed task back
/// so the caller can still run it.
pub(crate) struct SpawnError {
    pub error: io::Error,
    pub task: Option<Task>,
}

/// Capacity held by one live worker.
///
/// Dropping the slot decrements the live count first and returns the token second,
/// so the live count never exceeds the pool's concurrency.
pub(crate) struct Slot {
    pool: &'static str,
    tokens_rx: Receiver<()>,
    live: Arc<AtomicUsize>,
}

impl Slot {
    /// Records a new live worker. The caller must already hold a capacity token.
    pub fn acquire(pool: &'static str, tokens_rx: Receiver<()>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        gauge!("wspoll_pool_workers", "pool" => pool).increment(1.0);
        Self {
            pool,
            tokens_rx,
            live,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(pool = self.pool, "task panicked, worker exiting");
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        gauge!("wspoll_pool_workers", "pool" => self.pool).decrement(1.0);
        let _ = self.tokens_rx.try_recv();
    }
}

pub(crate) struct Worker {
    id: usize,
    pool: &'static str,
    work_rx: Receiver<Task>,
    idle_timeout: Option<Duration>,
    _slot: Slot,
}

impl Worker {
    /// Spawns a worker thread that runs `seed` and then serves the pool.
    pub fn start(
        id: usize,
        pool: &'static str,
        work_rx: Receiver<Task>,
        idle_timeout: Option<Duration>,
        slot: Slot,
        seed: Task,
    ) -> Result<(), SpawnError> {
        let seed = Arc::new(Mutex::new(Some(seed)));
        let worker_seed = seed.clone();

        let worker = Worker {
            id,
            pool,
            work_rx,
            idle_timeout,
            _slot: slot,
        };

        let builder = thread::Builder::new().name(format!("wspoll-{pool}-{id}"));
        match builder.spawn(move || {
            let task = worker_seed.lock().take();
            worker.run(task);
        }) {
            Ok(_) => Ok(()),
            Err(error) => Err(SpawnError {
                error,
                task: seed.lock().take(),
            }),
        }
    }

    /// Runs the seed, then blocks on the rendezvous channel for the next task.
    ///
    /// Without an idle timeout the loop only ends if the pool itself is dropped.
    fn run(self, seed: Option<Task>) {
        trace!(pool = self.pool, worker = self.id, "worker started");
        if let Some(task) = seed {
            task();
        }

        loop {
            let task = match self.idle_timeout {
                Some(timeout) => match self.work_rx.recv_timeout(timeout) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => {
                        trace!(pool = self.pool, worker = self.id, "worker idle, exiting");
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.work_rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };
            task();
        }
    }
}
