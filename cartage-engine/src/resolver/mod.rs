//! Resolution pass.
//!
//! Once the main pass has finished, every deferred record is streamed into
//! the resolution pool, one group per source key. A worker looks up the
//! target of each record and patches the output, or fetches and stores a
//! texture image. Records whose target is unknown are reported as
//! unresolved. Every record is counted exactly once, so
//! `resolved + unresolved == written` holds for a completed pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use cartage_core::pool::{
    Interrupt, PoolError, PoolSettings, SizingStrategy, Worker, WorkerError, WorkerFactory,
    WorkerPool,
};
use cartage_core::{
    DeferredKind, EventDispatcher, ExternalId, FeatureWriter, InternalKey, PayloadFetcher,
    PayloadStore, ReferenceKind, ResolvedReference, SessionEvent,
};
use cartage_data::{
    DeferredGroup, DeferredQueue, DeferredReference, PayloadLocation, StreamError, load_payload,
};
use log::{debug, info, warn};
use thiserror::Error;

use crate::error::{ErrorCode, FirstError, TransferError};
use crate::session::{SessionMonitor, finish_pool, start_pool};
use crate::splitter::SplitterHandle;
use crate::worker::PassContext;

/// Outcome of a resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Records deferred during the main pass.
    pub written: u64,
    /// Records whose target was found and patched or stored.
    pub resolved: u64,
    /// Records reported as unresolved.
    pub unresolved: u64,
}

impl ResolutionStats {
    /// Add `other` to these statistics.
    pub const fn merge(&mut self, other: &Self) {
        self.written += other.written;
        self.resolved += other.resolved;
        self.unresolved += other.unresolved;
    }

    /// Count `leftover` records that never reached a resolution pass as
    /// deferred and unresolved.
    pub const fn abandon(&mut self, leftover: u64) {
        self.written += leftover;
        self.unresolved += leftover;
    }
}

/// Resolved and unresolved counts shared by the resolver workers.
#[derive(Debug, Default)]
pub struct ResolutionTally {
    resolved: AtomicU64,
    unresolved: AtomicU64,
}

impl ResolutionTally {
    /// Records resolved so far.
    #[must_use]
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Records reported as unresolved so far.
    #[must_use]
    pub fn unresolved(&self) -> u64 {
        self.unresolved.load(Ordering::SeqCst)
    }

    fn count(&self, resolved: bool) {
        let counter = if resolved {
            &self.resolved
        } else {
            &self.unresolved
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Where resolved references and payloads go.
#[derive(Clone)]
pub struct ResolverTargets {
    /// Output receiving reference patches.
    pub writer: Arc<dyn FeatureWriter>,
    /// Store receiving texture images.
    pub payloads: Arc<dyn PayloadStore>,
    /// Downloads remote texture images.
    pub fetcher: Arc<dyn PayloadFetcher>,
    /// Folder relative image paths are resolved against.
    pub base_path: Option<Utf8PathBuf>,
}

impl std::fmt::Debug for ResolverTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverTargets")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

fn report_unresolved(events: &EventDispatcher, kind: DeferredKind, source: InternalKey, target: &str) {
    warn!("Failed to resolve {kind} reference from {source} to '{target}'.");
    events.trigger(&SessionEvent::UnresolvedReference {
        kind,
        source,
        target: target.to_owned(),
    });
}

/// Creates one [`ResolverWorker`] per resolution-pool thread.
#[derive(Debug)]
pub struct ResolverWorkerFactory {
    pass: PassContext,
    targets: ResolverTargets,
    tally: Arc<ResolutionTally>,
}

impl ResolverWorkerFactory {
    /// Factory patching `targets`.
    #[must_use]
    pub fn new(pass: PassContext, targets: ResolverTargets) -> Self {
        Self {
            pass,
            targets,
            tally: Arc::new(ResolutionTally::default()),
        }
    }

    /// Counts shared by every worker of this factory.
    #[must_use]
    pub fn tally(&self) -> Arc<ResolutionTally> {
        Arc::clone(&self.tally)
    }
}

impl WorkerFactory<DeferredGroup> for ResolverWorkerFactory {
    fn create_worker(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Box<dyn Worker<DeferredGroup>>, WorkerError> {
        Ok(Box::new(ResolverWorker {
            pass: self.pass.clone(),
            targets: self.targets.clone(),
            tally: Arc::clone(&self.tally),
            interrupt: interrupt.clone(),
        }))
    }
}

/// Resolves the deferred records of one source key at a time.
pub struct ResolverWorker {
    pass: PassContext,
    targets: ResolverTargets,
    tally: Arc<ResolutionTally>,
    interrupt: Interrupt,
}

impl ResolverWorker {
    fn resolve(&self, record: &DeferredReference) -> Result<bool, WorkerError> {
        match record {
            DeferredReference::GroupMember {
                group,
                member,
                role,
                is_parent,
            } => {
                let kind = if *is_parent {
                    ReferenceKind::GroupParent
                } else {
                    ReferenceKind::GroupMember
                };
                self.link(kind, *group, member, role.clone())
            }
            DeferredReference::FeatureLink {
                source,
                target,
                role,
            } => self.link(ReferenceKind::FeatureLink, *source, target, role.clone()),
            DeferredReference::TextureBinding { surface, texture } => {
                self.link(ReferenceKind::TextureBinding, *surface, texture, None)
            }
            DeferredReference::TextureImage { owner, uri } => Ok(self.store_image(*owner, uri)),
        }
    }

    fn link(
        &self,
        kind: ReferenceKind,
        source: InternalKey,
        target: &ExternalId,
        role: Option<String>,
    ) -> Result<bool, WorkerError> {
        let Some(entry) = self.pass.written_target(kind, target)? else {
            report_unresolved(&self.pass.events, kind.deferred_kind(), source, target.as_str());
            return Ok(false);
        };
        let resolved = ResolvedReference {
            kind,
            source,
            target: target.clone(),
            target_key: entry.key,
            role,
        };
        match self.targets.writer.apply(&resolved) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.pass.write_failed(target, err)?;
                Ok(false)
            }
        }
    }

    fn store_image(&self, owner: InternalKey, uri: &str) -> bool {
        let stored = PayloadLocation::parse(uri, self.targets.base_path.as_deref()).and_then(
            |location| {
                let bytes = load_payload(&location, self.targets.fetcher.as_ref())?;
                let name = location
                    .file_name()
                    .unwrap_or_else(|| format!("image_{owner}"));
                self.targets.payloads.store(owner, &name, &bytes)
            },
        );
        match stored {
            Ok(()) => true,
            Err(err) => {
                warn!("{err}");
                report_unresolved(&self.pass.events, DeferredKind::TextureImage, owner, uri);
                false
            }
        }
    }
}

impl Worker<DeferredGroup> for ResolverWorker {
    fn handle(&mut self, group: DeferredGroup) -> Result<(), WorkerError> {
        if self.interrupt.is_set() {
            return Ok(());
        }
        for record in &group.records {
            let resolved = self.resolve(&record.reference)?;
            self.tally.count(resolved);
        }
        self.pass.queue.mark_consumed(group.kind, &group.seqs())?;
        Ok(())
    }
}

#[derive(Debug, Error)]
enum Halt {
    #[error("resolution was stopped")]
    Stopped,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Streams every pending deferred record into the resolution pool.
pub struct ResolutionDriver<'a> {
    queue: &'a DeferredQueue,
    pool: &'a WorkerPool<DeferredGroup>,
    handle: SplitterHandle,
}

impl<'a> ResolutionDriver<'a> {
    /// Driver feeding `pool` from `queue`.
    #[must_use]
    pub fn new(queue: &'a DeferredQueue, pool: &'a WorkerPool<DeferredGroup>) -> Self {
        Self {
            queue,
            pool,
            handle: SplitterHandle::default(),
        }
    }

    /// Handle stopping this driver.
    #[must_use]
    pub fn handle(&self) -> SplitterHandle {
        self.handle.clone()
    }

    /// Submit the groups of every kind, kind by kind.
    ///
    /// Returns the number of groups submitted.
    ///
    /// # Errors
    /// Returns [`TransferError`] when a queue cannot be read or the pool
    /// fails for a reason other than being closed.
    pub fn run(&self) -> Result<u64, TransferError> {
        let mut submitted = 0_u64;
        for kind in DeferredKind::ALL {
            let streamed = self.queue.stream(kind, |group| -> Result<(), Halt> {
                if self.handle.is_stopped() {
                    return Err(Halt::Stopped);
                }
                self.pool.submit(group)?;
                submitted += 1;
                Ok(())
            });
            match streamed {
                Ok(()) => {}
                Err(StreamError::Visitor(Halt::Stopped | Halt::Pool(PoolError::Closed { .. }))) => {
                    debug!("resolution stopped while streaming {kind} records");
                    break;
                }
                Err(StreamError::Visitor(Halt::Pool(err))) => {
                    return Err(TransferError::coded(
                        ErrorCode::Aborted,
                        "failed to submit deferred records",
                        err,
                    ));
                }
                Err(StreamError::Queue(err)) => {
                    return Err(TransferError::coded(
                        ErrorCode::Cache,
                        format!("failed to read the deferred {kind} records"),
                        err,
                    ));
                }
            }
        }
        Ok(submitted)
    }
}

/// Report every record left unconsumed as unresolved and consume it.
///
/// Returns the number of records reported.
///
/// # Errors
/// Returns [`TransferError`] when a queue cannot be read or updated.
pub fn sweep(queue: &DeferredQueue, events: &EventDispatcher) -> Result<u64, TransferError> {
    let mut leftover = 0_u64;
    for kind in DeferredKind::ALL {
        queue
            .stream(kind, |group| {
                for record in &group.records {
                    let reference = &record.reference;
                    report_unresolved(events, kind, reference.source_key(), reference.target());
                    leftover += 1;
                }
                queue.mark_consumed(kind, &group.seqs())
            })
            .map_err(|err| {
                TransferError::coded(
                    ErrorCode::Cache,
                    format!("failed to sweep the deferred {kind} records"),
                    err,
                )
            })?;
    }
    Ok(leftover)
}

/// Report every record the session leaves behind as unresolved.
///
/// Buffered records are flushed and swept with the stored ones. Records
/// that cannot be flushed are reported in a warning. Failures are
/// recorded in `errors`. Returns the number of records reported.
pub(crate) fn abandon_leftovers(
    queue: &DeferredQueue,
    events: &EventDispatcher,
    errors: &mut FirstError,
) -> u64 {
    let flushed = queue.flush();
    let mut reported = sweep(queue, events).unwrap_or_else(|err| {
        errors.record(err);
        0
    });
    if let Err(err) = flushed {
        let buffered = queue
            .pending()
            .map(|pending| pending.values().sum::<u64>())
            .unwrap_or_default();
        warn!("Dropping {buffered} deferred references that could not be stored.");
        reported += buffered;
        errors.record(TransferError::coded(
            ErrorCode::Cache,
            "failed to flush the deferred records",
            err,
        ));
    }
    if reported > 0 {
        warn!("{reported} deferred references were left unresolved.");
    }
    reported
}

/// Run the resolution pass over the records deferred since `written_before`
/// records had been written.
///
/// Flushes the queue, drains it through a conservatively sized pool and
/// sweeps what is left unless the session was interrupted. An interrupted
/// pass only counts the records its workers handled.
pub(crate) fn resolve_deferred(
    pass: &PassContext,
    targets: ResolverTargets,
    settings: PoolSettings,
    monitor: &SessionMonitor,
    written_before: u64,
) -> Result<ResolutionStats, TransferError> {
    pass.queue.flush().map_err(|err| {
        TransferError::coded(ErrorCode::Cache, "failed to flush the deferred records", err)
    })?;
    let written = pass.queue.written().saturating_sub(written_before);
    if written == 0 {
        return Ok(ResolutionStats::default());
    }
    info!("Resolving {written} deferred references.");
    let factory = ResolverWorkerFactory::new(pass.clone(), targets);
    let tally = factory.tally();
    let pool = start_pool(
        "resolution",
        settings,
        SizingStrategy::Conservative,
        Arc::new(factory),
        &pass.events,
        monitor,
    )?;
    let driver = ResolutionDriver::new(&pass.queue, &pool);
    monitor.register_splitter(driver.handle());
    let driven = driver.run();
    let healthy = driven.is_ok() && !monitor.is_interrupted();
    let finished = finish_pool(&pool, healthy);
    let groups = driven?;
    finished?;
    debug!("resolved {groups} groups of deferred records");
    let mut stats = ResolutionStats {
        written,
        resolved: tally.resolved(),
        unresolved: tally.unresolved(),
    };
    if monitor.is_interrupted() {
        // Records the pool never handled are reported at teardown.
        stats.written = stats.resolved + stats.unresolved;
    } else {
        stats.unresolved += sweep(&pass.queue, &pass.events)?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests;
