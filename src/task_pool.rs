// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Manages collections of worker threads.
//!
//! Two shapes exist: a fixed-size pool over an unbounded queue (the hybrid
//! engine's `io`/`cpu`/`fast` pools) and a bounded pool that starts with a
//! core of workers, grows on demand up to a maximum, and falls back to
//! running the job on the submitting thread when saturated (the threaded
//! engine's connection pool).

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use futures::channel::oneshot;
use serde::Serialize;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A collection of worker threads consuming jobs from a shared queue.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<Shared>,
    // Workers hold `shared` but not this; when the last pool handle goes
    // away the guard disconnects the queue so they drain and exit.
    _guard: Arc<PoolGuard>,
}

struct PoolGuard {
    shared: Arc<Shared>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        drop(self.shared.sender.lock().unwrap().take());
    }
}

struct Shared {
    name: String,
    // Dropped (taken out) at shutdown so workers see a disconnect once the
    // queue drains.
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    exit_rx: Receiver<()>,
    exit_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    busy: AtomicUsize,
    max_workers: usize,
}

/// A point-in-time view of a pool, for the `/metrics` route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

impl TaskPool {
    /// A pool with exactly `size` workers over an unbounded queue.
    pub fn fixed(name: &str, size: usize) -> io::Result<TaskPool> {
        let (sender, receiver) = channel::unbounded();
        let pool = TaskPool::build(name, sender, receiver, size);
        for _ in 0..size {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    /// A pool that starts `core` workers, grows to `max` under load, and
    /// queues at most `queue_capacity` pending jobs. A job submitted when
    /// the queue is full and the pool cannot grow runs on the caller.
    pub fn bounded(
        name: &str,
        core: usize,
        max: usize,
        queue_capacity: usize,
    ) -> io::Result<TaskPool> {
        let (sender, receiver) = channel::bounded(queue_capacity);
        let pool = TaskPool::build(name, sender, receiver, max.max(core));
        for _ in 0..core {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    fn build(name: &str, sender: Sender<Job>, receiver: Receiver<Job>, max: usize) -> TaskPool {
        let (exit_tx, exit_rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            receiver,
            exit_rx,
            exit_tx,
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            max_workers: max,
        });
        TaskPool {
            _guard: Arc::new(PoolGuard {
                shared: shared.clone(),
            }),
            shared,
        }
    }

    fn spawn_worker(&self) -> io::Result<()> {
        let shared = self.shared.clone();
        let index = shared.spawned.fetch_add(1, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", shared.name, index))
            .spawn(move || {
                while let Ok(job) = shared.receiver.recv() {
                    shared.busy.fetch_add(1, Ordering::SeqCst);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                    shared.busy.fetch_sub(1, Ordering::SeqCst);
                    if outcome.is_err() {
                        log::error!("worker in pool {:?} panicked", shared.name);
                    }
                }
                let _ = shared.exit_tx.send(());
            })?;
        self.shared.workers.lock().unwrap().push(handle);
        Ok(())
    }

    /// Executes a function on a worker thread.
    ///
    /// After [`shutdown`](Self::shutdown) the queue is disconnected and the
    /// job runs on the caller instead of being dropped.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut job: Job = Box::new(job);

        let sender = self.shared.sender.lock().unwrap().clone();
        let sender = match sender {
            Some(sender) => sender,
            None => return job(),
        };

        match sender.try_send(job) {
            Ok(()) => return,
            Err(TrySendError::Disconnected(returned)) => return returned(),
            Err(TrySendError::Full(returned)) => job = returned,
        }

        // Queue full: grow if allowed, then retry once; otherwise the
        // caller runs the job itself.
        if self.shared.spawned.load(Ordering::SeqCst) < self.shared.max_workers {
            if let Err(err) = self.spawn_worker() {
                log::warn!("could not grow pool {:?}: {}", self.shared.name, err);
            }
        }
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(returned)) | Err(TrySendError::Disconnected(returned)) => {
                returned()
            }
        }
    }

    /// Runs a function on a worker and exposes its result as a future.
    ///
    /// The receiver resolves to `Err(Canceled)` if the pool shuts down
    /// before the job produced a value.
    pub fn offload<T, F>(&self, job: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(move || {
            let _ = tx.send(job());
        });
        rx
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.shared.name.clone(),
            workers: self.shared.spawned.load(Ordering::SeqCst),
            busy: self.shared.busy.load(Ordering::SeqCst),
            queued: self
                .shared
                .sender
                .lock()
                .unwrap()
                .as_ref()
                .map(|s| s.len())
                .unwrap_or(0),
        }
    }

    /// Stops accepting jobs, lets queued jobs finish, and waits up to
    /// `timeout` for the workers to exit. Returns false if some workers
    /// were still busy when the deadline passed; those are abandoned, not
    /// interrupted.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.shared.sender.lock().unwrap().take());

        let deadline = Instant::now() + timeout;
        let expected = self.shared.spawned.load(Ordering::SeqCst);
        for _ in 0..expected {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if self.shared.exit_rx.recv_timeout(remaining).is_err() {
                log::warn!(
                    "pool {:?} did not drain within {:?}",
                    self.shared.name,
                    timeout
                );
                return false;
            }
        }

        // Every worker has signalled; joining is instantaneous now.
        for handle in self.shared.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        true
    }
}
