//! Bounded-concurrency worker pool.
//!
//! A [`WorkerPool`] owns a bounded queue and between `min_threads` and
//! `max_threads` worker threads. Each thread owns one [`Worker`] created by
//! the pool's [`WorkerFactory`] and feeds it items until the pool shuts
//! down. `submit` blocks while the queue is full, which gives the producer
//! natural backpressure.
//!
//! Errors returned by [`Worker::handle`] and panics raised inside it are
//! caught at the thread boundary, reported to the pool's
//! [`PoolErrorHandler`], and the thread carries on with the next item.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use cartage_core::pool::{
//!     Interrupt, PoolSettings, SizingStrategy, Worker, WorkerError, WorkerFactory, WorkerPool,
//! };
//!
//! struct Sum(Arc<AtomicUsize>);
//!
//! impl Worker<usize> for Sum {
//!     fn handle(&mut self, item: usize) -> Result<(), WorkerError> {
//!         self.0.fetch_add(item, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! struct SumFactory(Arc<AtomicUsize>);
//!
//! impl WorkerFactory<usize> for SumFactory {
//!     fn create_worker(&self, _: &Interrupt) -> Result<Box<dyn Worker<usize>>, WorkerError> {
//!         Ok(Box::new(Sum(Arc::clone(&self.0))))
//!     }
//! }
//!
//! let total = Arc::new(AtomicUsize::new(0));
//! let pool = WorkerPool::new(
//!     "sum",
//!     PoolSettings { min_threads: 1, max_threads: 2, queue_capacity: 4 },
//!     SizingStrategy::Aggressive.policy(),
//!     Arc::new(SumFactory(Arc::clone(&total))),
//! )
//! .unwrap();
//! assert_eq!(pool.prestart_core_workers().unwrap(), 1);
//! for item in 1..=10 {
//!     pool.submit(item).unwrap();
//! }
//! pool.shutdown_and_wait().unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 55);
//! ```

mod sizing;

pub use sizing::{Aggressive, Conservative, PoolLoad, PoolSizing, SizingStrategy};

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::collab::BoxError;

/// Interval at which idle workers and blocked producers re-check the pool
/// state.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error type returned by workers and worker factories.
pub type WorkerError = BoxError;

/// Bounds of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Threads started by [`WorkerPool::prestart_core_workers`] and kept
    /// while idle.
    pub min_threads: usize,
    /// Upper bound on threads.
    pub max_threads: usize,
    /// Capacity of the work queue.
    pub queue_capacity: usize,
}

/// Errors raised by [`WorkerPool`] operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool no longer accepts work.
    #[error("pool {pool} is closed")]
    Closed {
        /// Pool name.
        pool: String,
    },
    /// The pool was shut down immediately while waiting for it.
    #[error("pool {pool} was shut down before its queue drained")]
    Aborted {
        /// Pool name.
        pool: String,
    },
    /// A worker thread could not be spawned.
    #[error("failed to spawn a worker thread for pool {pool}: {source}")]
    Spawn {
        /// Pool name.
        pool: String,
        /// Operating system error.
        #[source]
        source: io::Error,
    },
    /// The bounds were inconsistent.
    #[error("invalid settings for pool {pool}: {message}")]
    InvalidSettings {
        /// Pool name.
        pool: String,
        /// Reason.
        message: String,
    },
}

/// Failure caught at a worker thread boundary.
#[derive(Debug, Error)]
pub enum WorkerFailure {
    /// [`Worker::handle`] returned an error.
    #[error("work item failed: {0}")]
    Handler(#[source] WorkerError),
    /// A worker panicked.
    #[error("worker panicked: {0}")]
    Panic(String),
}

/// Receives failures caught by the pool.
pub trait PoolErrorHandler: Send + Sync {
    /// Called on the worker thread that observed `failure`.
    fn handle_failure(&self, pool: &str, failure: WorkerFailure);
}

impl<F> PoolErrorHandler for F
where
    F: Fn(&str, WorkerFailure) + Send + Sync,
{
    fn handle_failure(&self, pool: &str, failure: WorkerFailure) {
        self(pool, failure);
    }
}

/// Flag raised by [`WorkerPool::shutdown_now`].
///
/// Long-running handlers should poll it and abandon their item when set.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Whether the pool asked running handlers to stop.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Unit-of-work handler owned by one worker thread.
pub trait Worker<T>: Send {
    /// Process one item.
    ///
    /// # Errors
    /// An error is reported to the pool's [`PoolErrorHandler`]; the worker
    /// keeps running.
    fn handle(&mut self, item: T) -> Result<(), WorkerError>;

    /// Called once before the worker thread exits.
    fn finish(&mut self) {}
}

/// Creates one [`Worker`] per thread.
pub trait WorkerFactory<T>: Send + Sync {
    /// Create a worker observing `interrupt`.
    ///
    /// # Errors
    /// A failure leaves the pool with fewer threads; it is logged and counted
    /// against the achieved size.
    fn create_worker(&self, interrupt: &Interrupt) -> Result<Box<dyn Worker<T>>, WorkerError>;
}

struct Shared<T> {
    name: String,
    settings: PoolSettings,
    sizing: Arc<dyn PoolSizing>,
    factory: Arc<dyn WorkerFactory<T>>,
    error_handler: RwLock<Option<Arc<dyn PoolErrorHandler>>>,
    sender: Sender<T>,
    receiver: Receiver<T>,
    interrupt: Interrupt,
    closed: AtomicBool,
    aborted: AtomicBool,
    growth_blocked: AtomicBool,
    pending_submits: AtomicUsize,
    size: AtomicUsize,
    peak: AtomicUsize,
    next_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> Shared<T> {
    fn load(&self) -> PoolLoad {
        PoolLoad {
            pool_size: self.size.load(Ordering::SeqCst),
            min_threads: self.settings.min_threads,
            max_threads: self.settings.max_threads,
            queued: self.receiver.len(),
            queue_capacity: self.settings.queue_capacity,
        }
    }

    fn target_size(&self) -> usize {
        self.sizing
            .target_size(&self.load())
            .clamp(self.settings.min_threads, self.settings.max_threads)
    }

    fn report(&self, failure: WorkerFailure) {
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => handler.handle_failure(&self.name, failure),
            None => error!("{}: {failure}", self.name),
        }
    }

    fn execute(&self, worker: &mut dyn Worker<T>, item: T) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.handle(item)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => self.report(WorkerFailure::Handler(source)),
            Err(payload) => self.report(WorkerFailure::Panic(panic_message(payload.as_ref()))),
        }
    }

    fn try_retire(&self) -> bool {
        let size = self.size.load(Ordering::SeqCst);
        if size <= self.settings.min_threads || self.target_size() >= size {
            return false;
        }
        self.size
            .compare_exchange(size, size - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn reserve_slot(&self) -> Option<usize> {
        let mut current = self.size.load(Ordering::SeqCst);
        loop {
            if current >= self.settings.max_threads {
                return None;
            }
            match self.size.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    fn drain(&self) -> usize {
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn abort(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        self.interrupt.set();
        let discarded = self.drain();
        if discarded > 0 {
            debug!("{}: discarded {discarded} queued items", self.name);
        }
        discarded
    }

    fn terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst) && self.size.load(Ordering::SeqCst) == 0
    }

    fn join_all(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                if self.size.load(Ordering::SeqCst) == 0 {
                    return;
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("{}: worker thread terminated abnormally", self.name);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>) -> Result<bool, PoolError> {
    let Some(reserved) = shared.reserve_slot() else {
        return Ok(false);
    };
    let worker = match shared.factory.create_worker(&shared.interrupt) {
        Ok(worker) => worker,
        Err(source) => {
            shared.size.fetch_sub(1, Ordering::SeqCst);
            shared.growth_blocked.store(true, Ordering::SeqCst);
            warn!("{}: failed to create worker: {source}", shared.name);
            return Ok(false);
        }
    };
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let thread_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}-{id}", shared.name))
        .spawn(move || run_worker(&thread_shared, worker));
    match spawned {
        Ok(handle) => {
            shared.handles.lock().push(handle);
            shared.peak.fetch_max(reserved, Ordering::SeqCst);
            Ok(true)
        }
        Err(source) => {
            shared.size.fetch_sub(1, Ordering::SeqCst);
            Err(PoolError::Spawn {
                pool: shared.name.clone(),
                source,
            })
        }
    }
}

fn run_worker<T: Send + 'static>(shared: &Shared<T>, mut worker: Box<dyn Worker<T>>) {
    let retired = loop {
        if shared.aborted.load(Ordering::SeqCst) {
            break false;
        }
        match shared.receiver.recv_timeout(POLL_INTERVAL) {
            Ok(item) => shared.execute(worker.as_mut(), item),
            Err(RecvTimeoutError::Timeout) => {
                if shared.closed.load(Ordering::SeqCst) {
                    if shared.pending_submits.load(Ordering::SeqCst) == 0
                        && shared.receiver.is_empty()
                    {
                        break false;
                    }
                } else if shared.try_retire() {
                    break true;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break false,
        }
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| worker.finish())) {
        shared.report(WorkerFailure::Panic(panic_message(payload.as_ref())));
    }
    // A retiring worker already released its slot.
    if !retired {
        shared.size.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Adaptive, bounded pool of worker threads consuming items of type `T`.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("settings", &self.shared.settings)
            .field("pool_size", &self.pool_size())
            .field("queue_len", &self.queue_len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool without starting any thread.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidSettings`] when `min_threads` is zero,
    /// exceeds `max_threads`, or the queue capacity is zero.
    pub fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        sizing: Arc<dyn PoolSizing>,
        factory: Arc<dyn WorkerFactory<T>>,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        let problem = if settings.min_threads == 0 {
            Some("min_threads must be positive")
        } else if settings.min_threads > settings.max_threads {
            Some("min_threads exceeds max_threads")
        } else if settings.queue_capacity == 0 {
            Some("queue_capacity must be positive")
        } else {
            None
        };
        if let Some(message) = problem {
            return Err(PoolError::InvalidSettings {
                pool: name,
                message: message.to_owned(),
            });
        }
        let (sender, receiver) = bounded(settings.queue_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                settings,
                sizing,
                factory,
                error_handler: RwLock::new(None),
                sender,
                receiver,
                interrupt: Interrupt::default(),
                closed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                growth_blocked: AtomicBool::new(false),
                pending_submits: AtomicUsize::new(0),
                size: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Route caught failures to `handler` instead of the log.
    pub fn set_error_handler(&self, handler: Arc<dyn PoolErrorHandler>) {
        *self.shared.error_handler.write() = Some(handler);
    }

    /// Pool name used for thread names and log lines.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start `min_threads` workers now.
    ///
    /// Returns the number of live workers afterwards. Zero means the pool
    /// has no execution capacity and must not be used.
    ///
    /// # Errors
    /// Returns [`PoolError::Spawn`] when the operating system refuses a
    /// thread.
    pub fn prestart_core_workers(&self) -> Result<usize, PoolError> {
        while self.pool_size() < self.shared.settings.min_threads {
            if !spawn_worker(&self.shared)? {
                break;
            }
        }
        Ok(self.pool_size())
    }

    /// Enqueue an item, blocking while the queue is full.
    ///
    /// # Errors
    /// Returns [`PoolError::Closed`] once the pool has been shut down,
    /// including while this call was blocked.
    pub fn submit(&self, item: T) -> Result<(), PoolError> {
        self.shared.pending_submits.fetch_add(1, Ordering::SeqCst);
        let result = self.enqueue(item);
        self.shared.pending_submits.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.adapt_size();
        }
        result
    }

    fn enqueue(&self, item: T) -> Result<(), PoolError> {
        let mut pending = item;
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }
            match self.shared.sender.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    pending = returned;
                    self.adapt_size();
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(self.closed_error()),
            }
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.shared.name.clone(),
        }
    }

    fn adapt_size(&self) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let live = self.pool_size();
        let wanted = if live == 0 { 1 } else { shared.target_size() };
        if live >= wanted || (live > 0 && shared.growth_blocked.load(Ordering::SeqCst)) {
            return;
        }
        for _ in live..wanted {
            match spawn_worker(shared) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!("{}: {err}", shared.name);
                    break;
                }
            }
        }
    }

    /// Live worker threads.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneously live workers so far.
    #[must_use]
    pub fn peak_size(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    /// Items waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Stop accepting work, let the workers drain the queue and wait for
    /// every thread to exit.
    ///
    /// Must not be called from one of the pool's own workers.
    ///
    /// # Errors
    /// Returns [`PoolError::Aborted`] when [`shutdown_now`](Self::shutdown_now)
    /// discarded work while waiting.
    pub fn shutdown_and_wait(&self) -> Result<(), PoolError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.join_all();
        if self.shared.aborted.load(Ordering::SeqCst) {
            return Err(PoolError::Aborted {
                pool: self.shared.name.clone(),
            });
        }
        Ok(())
    }

    /// Stop accepting work, discard queued items, raise the [`Interrupt`]
    /// flag and return without waiting. Returns the number of discarded
    /// items.
    pub fn shutdown_now(&self) -> usize {
        self.shared.abort()
    }

    /// Discard queued items without affecting running handlers. Returns the
    /// number of discarded items.
    pub fn drain_work_queue(&self) -> usize {
        self.shared.drain()
    }

    /// Whether the pool is closed and every worker has exited.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated()
    }

    /// Type-erased handle used by the interrupt path.
    #[must_use]
    pub fn controller(&self) -> PoolController {
        PoolController {
            inner: Arc::clone(&self.shared) as Arc<dyn PoolControl>,
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.shared.terminated() {
            self.shared.abort();
        }
        self.shared.join_all();
    }
}

trait PoolControl: Send + Sync {
    fn name(&self) -> &str;
    fn drain_work_queue(&self) -> usize;
    fn shutdown_now(&self) -> usize;
    fn is_terminated(&self) -> bool;
}

impl<T: Send + 'static> PoolControl for Shared<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn drain_work_queue(&self) -> usize {
        self.drain()
    }

    fn shutdown_now(&self) -> usize {
        self.abort()
    }

    fn is_terminated(&self) -> bool {
        self.terminated()
    }
}

/// Non-generic handle to a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolController {
    inner: Arc<dyn PoolControl>,
}

impl fmt::Debug for PoolController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolController")
            .field("name", &self.inner.name())
            .finish()
    }
}

impl PoolController {
    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// See [`WorkerPool::drain_work_queue`].
    pub fn drain_work_queue(&self) -> usize {
        self.inner.drain_work_queue()
    }

    /// See [`WorkerPool::shutdown_now`].
    pub fn shutdown_now(&self) -> usize {
        self.inner.shutdown_now()
    }

    /// See [`WorkerPool::is_terminated`].
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}
