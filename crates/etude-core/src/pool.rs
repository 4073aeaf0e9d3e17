// src/pool.rs
//! Fixed-size worker pool fed by a bounded FIFO queue.
//!
//! The queue lives under one mutex, paired with a condition variable so idle
//! workers sleep instead of polling. `submit` never blocks the producer: a
//! full queue hands the task straight back.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{EtudeError, EtudeResult};

/// A unit of work a pool worker can run.
pub trait Task: Send + Sync + 'static {
    fn process(&self);
}

impl<T: Task + ?Sized> Task for Arc<T> {
    fn process(&self) {
        (**self).process()
    }
}

/// A rejected submission; the task is returned to the caller.
#[derive(Debug)]
pub enum SubmitError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The pool is shutting down.
    Stopped(T),
}

impl<T> SubmitError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SubmitError::Full(task) | SubmitError::Stopped(task) => task,
        }
    }
}

struct Queue<T> {
    tasks: VecDeque<T>,
    stopped: bool,
}

struct Inner<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPool<T: Task> {
    inner: Arc<Inner<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> ThreadPool<T> {
    pub fn new(workers: usize, capacity: usize) -> EtudeResult<Self> {
        Self::with_pinning(workers, capacity, false)
    }

    /// Spawn `workers` threads, optionally pinning worker `i` to core `i % cores`.
    pub fn with_pinning(workers: usize, capacity: usize, pin: bool) -> EtudeResult<Self> {
        if workers == 0 || capacity == 0 {
            return Err(EtudeError::InvalidConfig(
                "pool needs at least one worker and one queue slot".to_string(),
            ));
        }

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        // Built up in place so a failed spawn still joins the threads already running.
        let mut pool = Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    tasks: VecDeque::with_capacity(capacity),
                    stopped: false,
                }),
                available: Condvar::new(),
                capacity,
            }),
            workers: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let inner = Arc::clone(&pool.inner);
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(i, &inner);
                })?;
            pool.workers.push(handle);
        }

        tracing::debug!(workers, capacity, "worker pool started");
        Ok(pool)
    }

    /// Enqueue a task and wake one idle worker.
    pub fn submit(&self, task: T) -> Result<(), SubmitError<T>> {
        {
            let mut queue = self.inner.lock();
            if queue.stopped {
                return Err(SubmitError::Stopped(task));
            }
            if queue.tasks.len() >= self.inner.capacity {
                return Err(SubmitError::Full(task));
            }
            queue.tasks.push_back(task);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, wake every idle worker, let queued tasks drain,
    /// and join all threads.
    pub fn shutdown(&mut self) {
        self.inner.lock().stopped = true;
        self.inner.available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Task> std::fmt::Debug for ThreadPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

fn run_worker<T: Task>(id: usize, inner: &Inner<T>) {
    loop {
        let task = {
            let mut queue = inner.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stopped {
                    tracing::trace!(worker = id, "worker exiting");
                    return;
                }
                queue = inner
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.process())).is_err() {
            tracing::error!(worker = id, "task panicked; worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct FnTask(Box<dyn Fn() + Send + Sync>);

    impl std::fmt::Debug for FnTask {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("FnTask")
        }
    }

    impl Task for FnTask {
        fn process(&self) {
            (self.0)()
        }
    }

    fn task(f: impl Fn() + Send + Sync + 'static) -> FnTask {
        FnTask(Box::new(f))
    }

    /// A task that reports it started, then blocks until the gate closes.
    fn blocker() -> (FnTask, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let t = task(move || {
            started_tx.send(()).ok();
            gate_rx.lock().unwrap().recv().ok();
        });
        (t, started_rx, gate_tx)
    }

    #[test]
    fn runs_every_submitted_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(4, 64).unwrap();
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            pool.submit(task(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let mut pool = ThreadPool::new(1, 2).unwrap();
        let (block, started, gate) = blocker();
        pool.submit(block).unwrap();
        started.recv().unwrap();

        pool.submit(task(|| {})).unwrap();
        pool.submit(task(|| {})).unwrap();

        let before = Instant::now();
        let rejected = pool.submit(task(|| {}));
        assert!(matches!(rejected, Err(SubmitError::Full(_))));
        assert!(before.elapsed() < Duration::from_millis(100));
        assert_eq!(pool.queued(), 2);

        gate.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn concurrent_submitters_never_exceed_capacity() {
        let capacity = 16;
        let pool = Arc::new(ThreadPool::new(1, capacity).unwrap());
        let (block, started, gate) = blocker();
        pool.submit(block).unwrap();
        started.recv().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    for _ in 0..10 {
                        if pool.submit(task(|| {})).is_ok() {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for s in submitters {
            s.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), capacity);
        assert_eq!(pool.queued(), capacity);
        gate.send(()).unwrap();
    }

    #[test]
    fn shutdown_wakes_idle_workers() {
        let mut pool: ThreadPool<FnTask> = ThreadPool::new(8, 4).unwrap();
        // Let every worker reach its wait.
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.workers(), 0);
        assert!(matches!(
            pool.submit(task(|| {})),
            Err(SubmitError::Stopped(_))
        ));
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(1, 8).unwrap();
        pool.submit(task(|| panic!("boom"))).unwrap();
        let c = Arc::clone(&counter);
        pool.submit(task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(ThreadPool::<FnTask>::new(0, 1).is_err());
        assert!(ThreadPool::<FnTask>::new(1, 0).is_err());
    }
}
