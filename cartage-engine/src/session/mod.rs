//! Session state, interrupt handling and session-scoped resources.
//!
//! A [`SessionMonitor`] is registered on the session's dispatcher. It sums
//! the counters reported by workers, counts per-item failures and applies
//! the first interrupt: production stops, queued work is drained and the
//! cause is kept. Later interrupts are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cartage_core::pool::{
    PoolController, PoolError, PoolSettings, SizingStrategy, WorkerFactory, WorkerFailure,
    WorkerPool,
};
use cartage_core::{
    Counters, EventDispatcher, EventHandler, InterruptEvent, SessionEvent, TransferConfig,
};
use cartage_data::{CacheTableStore, DeferredQueue, IdCacheManager};
use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{ErrorCode, FirstError, TransferError};
use crate::resolver::abandon_leftovers;
use crate::splitter::SplitterHandle;

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not started.
    #[default]
    Idle,
    /// Checking preconditions and creating resources.
    Preparing,
    /// Main pass in progress.
    Running,
    /// Resolution pass in progress.
    Resolving,
    /// Ran to its end; `success` is false when the session failed.
    Finished {
        /// Whether the session returned a report.
        success: bool,
    },
    /// Interrupted by a cancellation before every tile was processed.
    Aborted,
}

impl SessionState {
    /// Whether a session in this state is still working.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Preparing | Self::Running | Self::Resolving)
    }

    /// State a session settles in once its run returns: `Ok(completed)`
    /// for a report, `Err` for a failure.
    #[must_use]
    pub const fn settled<E>(outcome: &Result<bool, E>) -> Self {
        match outcome {
            Ok(true) => Self::Finished { success: true },
            Ok(false) => Self::Aborted,
            Err(_) => Self::Finished { success: false },
        }
    }
}

/// Shared, thread-safe [`SessionState`].
#[derive(Debug, Default)]
pub struct SessionStatus(Mutex<SessionState>);

impl SessionStatus {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.0.lock()
    }

    /// Move to `state`.
    pub fn set(&self, state: SessionState) {
        let mut current = self.0.lock();
        debug!("session state {:?} -> {state:?}", *current);
        *current = state;
    }

    /// Enter [`SessionState::Preparing`] unless a session is already
    /// active.
    ///
    /// # Errors
    /// Returns [`TransferError`] when the session is already running.
    pub fn begin(&self) -> Result<(), TransferError> {
        let mut current = self.0.lock();
        if current.is_active() {
            return Err(TransferError::new("a transfer session is already running")
                .with_code(ErrorCode::Configuration));
        }
        *current = SessionState::Preparing;
        Ok(())
    }
}

/// Counters, failures and the interrupt of one session.
#[derive(Debug, Default)]
pub struct SessionMonitor {
    tile: Mutex<Counters>,
    total: Mutex<Counters>,
    failed_items: AtomicU64,
    unresolved: AtomicU64,
    interrupted: AtomicBool,
    interrupt: Mutex<Option<InterruptEvent>>,
    splitters: Mutex<Vec<SplitterHandle>>,
    pools: Mutex<Vec<PoolController>>,
}

impl SessionMonitor {
    /// Monitor without any registered component.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop `handle` when the session is interrupted. A handle registered
    /// after the interrupt is stopped at once.
    pub fn register_splitter(&self, handle: SplitterHandle) {
        let mut splitters = self.splitters.lock();
        if self.is_interrupted() {
            handle.shutdown();
        }
        splitters.push(handle);
    }

    /// Drain `pool` when the session is interrupted. A pool registered
    /// after the interrupt is drained at once.
    pub fn register_pool(&self, pool: PoolController) {
        let mut pools = self.pools.lock();
        if self.is_interrupted() {
            pool.drain_work_queue();
        }
        pools.push(pool);
    }

    /// Forget every registered splitter and pool.
    pub fn release(&self) {
        self.splitters.lock().clear();
        self.pools.lock().clear();
    }

    /// Whether an interrupt has been applied.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The interrupt that stopped the session, if any.
    #[must_use]
    pub fn interrupt(&self) -> Option<InterruptEvent> {
        self.interrupt.lock().clone()
    }

    /// Whether the applied interrupt reports a failure rather than a user
    /// cancellation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.interrupt
            .lock()
            .as_ref()
            .is_some_and(|event| event.level == log::Level::Error)
    }

    /// Items skipped because of per-item failures.
    #[must_use]
    pub fn failed_items(&self) -> u64 {
        self.failed_items.load(Ordering::SeqCst)
    }

    /// References reported as unresolved.
    #[must_use]
    pub fn unresolved(&self) -> u64 {
        self.unresolved.load(Ordering::SeqCst)
    }

    /// Counters of the current tile. The tile counters are reset and
    /// added to the session totals.
    pub fn take_tile_counters(&self) -> Counters {
        let counters = std::mem::take(&mut *self.tile.lock());
        self.total.lock().merge(&counters);
        counters
    }

    /// Counters of every finished tile.
    #[must_use]
    pub fn totals(&self) -> Counters {
        self.total.lock().clone()
    }

    fn apply_interrupt(&self, event: &InterruptEvent) {
        if self
            .interrupted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("ignoring interrupt: {}", event.message);
            return;
        }
        log::log!(event.level, "{}", event.message);
        *self.interrupt.lock() = Some(event.clone());
        for splitter in self.splitters.lock().iter() {
            splitter.shutdown();
        }
        for pool in self.pools.lock().iter() {
            let dropped = pool.drain_work_queue();
            if dropped > 0 {
                debug!("{}: discarded {dropped} queued items", pool.name());
            }
        }
    }
}

impl EventHandler for SessionMonitor {
    fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ObjectCounter(counts) => self.tile.lock().add_objects(counts),
            SessionEvent::GeometryCounter(counts) => self.tile.lock().add_geometries(counts),
            SessionEvent::ItemFailed { .. } => {
                self.failed_items.fetch_add(1, Ordering::SeqCst);
            }
            SessionEvent::UnresolvedReference { .. } => {
                self.unresolved.fetch_add(1, Ordering::SeqCst);
            }
            SessionEvent::Interrupt(interrupt) => self.apply_interrupt(interrupt),
            _ => {}
        }
    }
}

/// Create a pool, route its worker failures to a fatal interrupt and
/// start its core workers.
pub(crate) fn start_pool<T: Send + 'static>(
    name: &str,
    settings: PoolSettings,
    strategy: SizingStrategy,
    factory: Arc<dyn WorkerFactory<T>>,
    events: &EventDispatcher,
    monitor: &SessionMonitor,
) -> Result<WorkerPool<T>, TransferError> {
    let pool = WorkerPool::new(name, settings, strategy.policy(), factory).map_err(|err| {
        TransferError::coded(
            ErrorCode::Configuration,
            format!("failed to create the {name} pool"),
            err,
        )
    })?;
    let dispatcher = events.clone();
    pool.set_error_handler(Arc::new(move |pool_name: &str, failure: WorkerFailure| {
        let message = format!("A fatal error occurred in the {pool_name} pool: {failure}");
        dispatcher.trigger(&SessionEvent::Interrupt(InterruptEvent::fatal(
            message,
            Arc::new(failure),
        )));
    }));
    let started = pool.prestart_core_workers().map_err(|err| {
        TransferError::coded(
            ErrorCode::NoWorkers,
            format!("failed to start the {name} pool"),
            err,
        )
    })?;
    if started == 0 {
        return Err(
            TransferError::new(format!("the {name} pool started without workers"))
                .with_code(ErrorCode::NoWorkers),
        );
    }
    debug!("{name} pool started with {started} workers");
    monitor.register_pool(pool.controller());
    Ok(pool)
}

/// Shut `pool` down: gracefully while the session is healthy, immediately
/// otherwise.
pub(crate) fn finish_pool<T: Send + 'static>(
    pool: &WorkerPool<T>,
    healthy: bool,
) -> Result<(), TransferError> {
    if !healthy {
        pool.shutdown_now();
    }
    match pool.shutdown_and_wait() {
        Ok(()) => Ok(()),
        Err(PoolError::Aborted { .. }) if !healthy => Ok(()),
        Err(err) => Err(TransferError::coded(
            ErrorCode::Aborted,
            format!("the {} pool did not shut down cleanly", pool.name()),
            err,
        )),
    }
}

/// Cache tables, id caches and deferred queues of one session.
#[derive(Debug)]
pub(crate) struct SessionResources {
    store: CacheTableStore,
    pub(crate) caches: Arc<IdCacheManager>,
    pub(crate) queue: Arc<DeferredQueue>,
}

impl SessionResources {
    /// Create the cache table store, both id caches and the deferred
    /// queues.
    pub(crate) fn create(config: &TransferConfig) -> Result<Self, TransferError> {
        let store = CacheTableStore::create(None).map_err(|err| {
            TransferError::coded(ErrorCode::Cache, "failed to create the temporary cache", err)
        })?;
        let caches = IdCacheManager::new(
            &store,
            &config.id_cache,
            config.batching.id_cache_batch_size,
            config.thread_pool.max_threads,
        )
        .map_err(|err| {
            TransferError::coded(ErrorCode::Cache, "failed to create the id caches", err)
        })?;
        let queue =
            DeferredQueue::new(&store, config.batching.deferred_batch_size).map_err(|err| {
                TransferError::coded(
                    ErrorCode::Cache,
                    "failed to create the deferred reference queues",
                    err,
                )
            })?;
        Ok(Self {
            store,
            caches: Arc::new(caches),
            queue: Arc::new(queue),
        })
    }

    /// Report the deferred records nothing consumed, shut the id caches
    /// down and delete every cache table, recording failures in `errors`.
    ///
    /// Returns the number of deferred records reported as unresolved.
    pub(crate) fn teardown(self, events: &EventDispatcher, errors: &mut FirstError) -> u64 {
        let leftover = abandon_leftovers(&self.queue, events, errors);
        errors.check(self.caches.shutdown(), |err| {
            TransferError::coded(ErrorCode::Cache, "failed to shut down the id caches", err)
        });
        info!("Cleaning temporary cache.");
        errors.check(self.store.drop_all(), |err| {
            TransferError::coded(ErrorCode::Cache, "failed to clean the temporary cache", err)
        });
        leftover
    }
}
