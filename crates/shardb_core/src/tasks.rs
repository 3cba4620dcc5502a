//! Worker threads and completion handles.
//!
//! Blocking page I/O and queued driver requests run on a [`TaskPool`]: a
//! fixed set of named threads, each draining its own [`LocalTaskQueue`].
//! Results travel back through one-shot channels wrapped in [`Pending`].

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work for a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receiving half of a one-shot completion.
///
/// Dropping the [`Resolver`] without answering makes [`Pending::wait`] return
/// [`CoreError::Disconnected`] converted into `E`.
#[derive(Debug)]
pub struct Pending<T, E = CoreError> {
    rx: mpsc::Receiver<Result<T, E>>,
}

/// Sending half of a one-shot completion.
#[derive(Debug)]
pub struct Resolver<T, E = CoreError> {
    tx: mpsc::SyncSender<Result<T, E>>,
}

/// Creates a connected resolver and pending pair.
#[must_use]
pub fn pending<T, E>() -> (Resolver<T, E>, Pending<T, E>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Resolver { tx }, Pending { rx })
}

impl<T, E> Resolver<T, E> {
    /// Delivers the result. A caller that stopped waiting is not an error.
    pub fn resolve(self, result: Result<T, E>) {
        let _ = self.tx.send(result);
    }
}

impl<T, E: From<CoreError>> Pending<T, E> {
    /// Creates a completion that already holds its result.
    #[must_use]
    pub fn ready(result: Result<T, E>) -> Self {
        let (resolver, pending) = pending();
        resolver.resolve(result);
        pending
    }

    /// Blocks until the result arrives.
    pub fn wait(self) -> Result<T, E> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(CoreError::Disconnected.into()))
    }

    /// Returns the result if it has arrived, without blocking.
    ///
    /// The result is handed out once; later calls report
    /// [`CoreError::Disconnected`].
    pub fn try_wait(&self) -> Option<Result<T, E>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(CoreError::Disconnected.into())),
        }
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

/// The work queue owned by one worker thread.
pub struct LocalTaskQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl LocalTaskQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Enqueues a task and wakes the worker.
    pub fn submit(&self, task: Task) {
        self.state.lock().tasks.push_back(task);
        self.wake.notify_one();
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// Blocks for the next task; `None` once shut down and drained.
    fn next(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            self.wake.wait(&mut state);
        }
    }

    fn run(&self, name: &str) {
        while let Some(task) = self.next() {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(worker = name, "task panicked");
            }
        }
    }
}

/// A fixed set of worker threads.
///
/// Dropping the pool lets every worker drain its queue, then joins it.
pub struct TaskPool {
    name: String,
    queues: Vec<Arc<LocalTaskQueue>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `workers` threads named `<name>-<n>`.
    ///
    /// # Errors
    ///
    /// Returns an error if `workers` is zero or a thread cannot be spawned.
    pub fn new(name: &str, workers: usize) -> CoreResult<Self> {
        if workers == 0 {
            return Err(CoreError::invalid_config(format!(
                "task pool '{name}' needs at least one worker"
            )));
        }

        let mut pool = Self {
            name: name.to_string(),
            queues: Vec::with_capacity(workers),
            workers: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let queue = Arc::new(LocalTaskQueue::new());
            let thread_name = format!("{name}-{i}");
            let worker_queue = Arc::clone(&queue);
            let label = thread_name.clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_queue.run(&label))?;
            pool.queues.push(queue);
            pool.workers.push(handle);
        }

        tracing::debug!(pool = name, workers, "task pool started");
        Ok(pool)
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Runs `task` on a randomly chosen worker.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let index = rand::thread_rng().gen_range(0..self.queues.len());
        self.queues[index].submit(Box::new(task));
    }

    /// Runs `f` on a worker and returns a handle to its result.
    pub fn spawn<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CoreResult<T> + Send + 'static,
    {
        let (resolver, pending) = pending();
        self.submit(move || resolver.resolve(f()));
        pending
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.shutdown();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!(pool = %self.name, "task pool stopped");
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.name)
            .field("workers", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawn_returns_result() {
        let pool = TaskPool::new("test", 2).unwrap();
        let pending = pool.spawn(|| Ok(6 * 7));
        assert_eq!(pending.wait().unwrap(), 42);
    }

    #[test]
    fn spawn_propagates_errors() {
        let pool = TaskPool::new("test", 1).unwrap();
        let pending: Pending<()> = pool.spawn(|| Err(CoreError::invariant("boom")));
        assert!(matches!(
            pending.wait(),
            Err(CoreError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = TaskPool::new("test", 3).unwrap();
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = TaskPool::new("test", 1).unwrap();
        pool.submit(|| panic!("task failure"));
        assert_eq!(pool.spawn(|| Ok("still running")).wait().unwrap(), "still running");
    }

    #[test]
    fn dropped_resolver_disconnects() {
        let (resolver, pending) = pending::<u32, CoreError>();
        assert!(pending.try_wait().is_none());
        drop(resolver);
        assert!(matches!(pending.wait(), Err(CoreError::Disconnected)));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(TaskPool::new("empty", 0).is_err());
    }
}
