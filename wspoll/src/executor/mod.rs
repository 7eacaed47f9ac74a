//! Bounded worker pools.
//!
//! A [`Pool`] runs at most `concurrency` tasks at once. Workers are spawned lazily,
//! one per capacity token, and are reused for every later task: `schedule` hands a
//! task straight to a worker that is waiting for work, or spends a token to start a
//! new worker seeded with it. When neither is possible the caller blocks, which is
//! how a saturated pool pushes back on whoever is producing work.

mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender};
use metrics::counter;
use tracing::error;

use self::worker::{Slot, Worker};
use crate::task::Task;

/// A fixed-capacity set of reusable worker threads.
pub struct Pool {
    name: &'static str,
    /// Zero-capacity channel; a send only completes when a worker is receiving.
    work_tx: Sender<Task>,
    work_rx: Receiver<Task>,
    /// Holds one token per live worker.
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    live: Arc<AtomicUsize>,
    next_id: AtomicUsize,
    idle_timeout: Option<Duration>,
}

impl Pool {
    /// Creates a pool that runs at most `concurrency` tasks at once.
    ///
    /// `name` labels the worker threads, logs and metrics. With `idle_timeout` set,
    /// workers that wait that long without receiving a task exit and give their
    /// capacity back; otherwise they live as long as the pool.
    /// A `concurrency` of zero is treated as one.
    pub fn new(name: &'static str, concurrency: usize, idle_timeout: Option<Duration>) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::bounded(0);
        let (tokens_tx, tokens_rx) = crossbeam_channel::bounded(concurrency.max(1));

        Self {
            name,
            work_tx,
            work_rx,
            tokens_tx,
            tokens_rx,
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(0),
            idle_timeout,
        }
    }

    /// Schedules `task` to run exactly once on some worker.
    ///
    /// Blocks until a waiting worker accepts the task or capacity frees up to spawn a
    /// new one.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        counter!("wspoll_pool_tasks_total", "pool" => self.name).increment(1);
        let task: Task = Box::new(task);

        let mut select = Select::new();
        let handoff = select.send(&self.work_tx);
        let spawn = select.send(&self.tokens_tx);
        let oper = select.select();

        // The pool owns a receiver for both channels, so neither send can fail.
        match oper.index() {
            i if i == handoff => {
                let _ = oper.send(&self.work_tx, task);
            }
            i if i == spawn => {
                let _ = oper.send(&self.tokens_tx, ());
                self.spawn_worker(task);
            }
            _ => unreachable!("select returned an unregistered operation"),
        }
    }

    /// Number of worker threads currently alive.
    pub fn workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn spawn_worker(&self, task: Task) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::acquire(self.name, self.tokens_rx.clone(), self.live.clone());

        let spawned = Worker::start(
            id,
            self.name,
            self.work_rx.clone(),
            self.idle_timeout,
            slot,
            task,
        );

        // The slot was dropped with the failed closure, returning the token.
        if let Err(err) = spawned {
            error!(pool = self.name, error = %err.error, "failed to spawn worker, running task inline");
            if let Some(task) = err.task {
                task();
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("workers", &self.workers())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
