//! Request and sequence phases for one driver.

use crate::driver::Sequenceable;
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::tasks::{pending, Pending, TaskPool};
use crate::types::SequenceId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Completion of one sequence item.
pub type SequenceDone = Box<dyn FnOnce(CoreResult<()>) + Send + 'static>;

type Request<D> = Box<dyn FnOnce(&D) + Send + 'static>;

struct SequenceItem {
    sequence_id: SequenceId,
    mutations: Arc<[Mutation]>,
    done: SequenceDone,
}

struct QueueState<D: ?Sized> {
    /// Requests currently running.
    active: usize,
    /// A sequence item is being applied.
    sequencing: bool,
    items: VecDeque<SequenceItem>,
    requests: VecDeque<Request<D>>,
    shutdown: bool,
}

struct Shared<D: ?Sized> {
    name: String,
    driver: Arc<D>,
    process: Arc<TaskPool>,
    state: Mutex<QueueState<D>>,
    /// Wakes the sequencing thread.
    wake: Condvar,
    /// Signals that the request phase reopened.
    phase: Condvar,
}

impl<D> Shared<D>
where
    D: Sequenceable + ?Sized + 'static,
{
    fn finish_request(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 && !state.items.is_empty() {
            self.wake.notify_one();
        }
    }

    fn run(self: &Arc<Self>) {
        loop {
            let item = {
                let mut state = self.state.lock();
                loop {
                    if state.active == 0 {
                        if let Some(item) = state.items.pop_front() {
                            state.sequencing = true;
                            break item;
                        }
                    }
                    if state.shutdown && state.items.is_empty() {
                        return;
                    }
                    self.wake.wait(&mut state);
                }
            };

            let result = self.driver.sequence(item.sequence_id, &item.mutations);
            if let Err(err) = &result {
                tracing::warn!(
                    driver = %self.name,
                    sequence_id = %item.sequence_id,
                    error = %err,
                    "sequencing failed"
                );
            }
            (item.done)(result);

            let requests: Vec<Request<D>> = {
                let mut state = self.state.lock();
                if !state.items.is_empty() {
                    continue;
                }
                state.sequencing = false;
                let requests: Vec<_> = state.requests.drain(..).collect();
                state.active += requests.len();
                requests
            };
            self.phase.notify_all();
            for request in requests {
                let shared = Arc::clone(self);
                self.process.submit(move || {
                    request(&*shared.driver);
                    shared.finish_request();
                });
            }
        }
    }
}

/// Serializes access to one driver.
///
/// - Requests (fetches and queries) run concurrently while no sequence item
///   is pending. Otherwise they wait until every pending item is applied.
/// - Sequence items are applied one at a time, in arrival order, on a
///   dedicated thread, once in-flight requests have drained.
pub struct DriverQueue<D: ?Sized> {
    shared: Arc<Shared<D>>,
    worker: Option<JoinHandle<()>>,
}

impl<D> DriverQueue<D>
where
    D: Sequenceable + ?Sized + 'static,
{
    /// Starts the sequencing thread for `driver`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: &str, driver: Arc<D>, process: Arc<TaskPool>) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            driver,
            process,
            state: Mutex::new(QueueState {
                active: 0,
                sequencing: false,
                items: VecDeque::new(),
                requests: VecDeque::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            phase: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("sequence-{name}"))
            .spawn(move || runner.run())?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// The driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<D> {
        &self.shared.driver
    }

    /// Name used for the thread and in log events.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues the mutations of one commit. `done` runs on the sequencing
    /// thread once they are applied.
    pub fn sequence(
        &self,
        sequence_id: SequenceId,
        mutations: Arc<[Mutation]>,
        done: SequenceDone,
    ) {
        let mut state = self.shared.state.lock();
        state.items.push_back(SequenceItem {
            sequence_id,
            mutations,
            done,
        });
        if state.active == 0 {
            self.shared.wake.notify_one();
        }
    }

    /// Runs `f` now if the request phase is open; otherwise queues it for
    /// the process pool once the pending sequence items are applied.
    pub fn request<T, E, F>(&self, f: F) -> Pending<T, E>
    where
        T: Send + 'static,
        E: From<CoreError> + Send + 'static,
        F: FnOnce(&D) -> Result<T, E> + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.sequencing || !state.items.is_empty() {
                let (resolver, pending) = pending();
                state
                    .requests
                    .push_back(Box::new(move |driver: &D| resolver.resolve(f(driver))));
                return pending;
            }
            state.active += 1;
        }

        let result = f(&*self.shared.driver);
        self.shared.finish_request();
        Pending::ready(result)
    }

    /// Runs `f` on the calling thread, blocking until the request phase is
    /// open.
    ///
    /// Used by callers that already run on a worker, so that a full process
    /// pool cannot stall them.
    pub fn call<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&D) -> T,
    {
        {
            let mut state = self.shared.state.lock();
            while state.sequencing || !state.items.is_empty() {
                self.shared.phase.wait(&mut state);
            }
            state.active += 1;
        }

        let result = f(&*self.shared.driver);
        self.shared.finish_request();
        result
    }

    /// Number of sequence items not yet applied.
    #[must_use]
    pub fn pending_items(&self) -> usize {
        let state = self.shared.state.lock();
        state.items.len() + usize::from(state.sequencing)
    }
}

impl<D: ?Sized> Drop for DriverQueue<D> {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<D: ?Sized> std::fmt::Debug for DriverQueue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::types::StorageIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<u64>>,
        in_request: AtomicUsize,
        overlap: AtomicUsize,
    }

    impl Sequenceable for Recorder {
        fn sequence(&self, sequence_id: SequenceId, _mutations: &[Mutation]) -> CoreResult<()> {
            if self.in_request.load(Ordering::SeqCst) > 0 {
                self.overlap.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(2));
            self.applied.lock().push(sequence_id.as_u64());
            Ok(())
        }

        fn reinspect(&self, _mutation: &Mutation) -> CoreResult<()> {
            Ok(())
        }
    }

    fn queue() -> DriverQueue<Recorder> {
        let pool = Arc::new(TaskPool::new("queue-test", 2).unwrap());
        DriverQueue::new("recorder", Arc::new(Recorder::default()), pool).unwrap()
    }

    fn mutations() -> Arc<[Mutation]> {
        Arc::from(vec![Mutation::insert(StorageIndex(0), b"x".to_vec())])
    }

    #[test]
    fn items_apply_in_order_and_ack() {
        let queue = queue();
        let (tx, rx) = mpsc::channel();
        for seq in 1..=20u64 {
            let tx = tx.clone();
            queue.sequence(
                SequenceId::new(seq),
                mutations(),
                Box::new(move |result: CoreResult<()>| {
                    tx.send((seq, result.is_ok())).unwrap();
                }),
            );
        }

        let acks: Vec<_> = (0..20).map(|_| rx.recv().unwrap()).collect();
        assert!(acks.iter().all(|&(_, ok)| ok));
        assert_eq!(
            acks.iter().map(|&(seq, _)| seq).collect::<Vec<_>>(),
            (1..=20).collect::<Vec<_>>()
        );
        assert_eq!(*queue.driver().applied.lock(), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn request_runs_inline_when_idle() {
        let queue = queue();
        let pending: Pending<usize, CoreError> =
            queue.request(|driver| Ok(driver.applied.lock().len()));
        assert_eq!(pending.try_wait().unwrap().unwrap(), 0);
    }

    #[test]
    fn requests_see_all_earlier_items() {
        let queue = queue();
        for seq in 1..=10u64 {
            queue.sequence(SequenceId::new(seq), mutations(), Box::new(|_: CoreResult<()>| {}));
        }
        let seen: Pending<usize, CoreError> =
            queue.request(|driver| Ok(driver.applied.lock().len()));
        assert_eq!(seen.wait().unwrap(), 10);
        assert_eq!(queue.call(|driver| driver.applied.lock().len()), 10);
    }

    #[test]
    fn phases_never_overlap() {
        let queue = Arc::new(queue());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..20 {
                        queue.call(|driver| {
                            driver.in_request.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            driver.in_request.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        let (tx, rx) = mpsc::channel();
        for seq in 1..=30u64 {
            let tx = tx.clone();
            queue.sequence(
                SequenceId::new(seq),
                mutations(),
                Box::new(move |_: CoreResult<()>| {
                    let _ = tx.send(());
                }),
            );
        }
        for reader in readers {
            reader.join().unwrap();
        }
        for _ in 0..30 {
            rx.recv().unwrap();
        }
        assert_eq!(queue.driver().overlap.load(Ordering::SeqCst), 0);
    }
}
