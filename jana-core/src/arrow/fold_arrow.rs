use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;

use jana_contracts::{FactoryError, FoldStatus, Folder, LocationId};

use crate::error::EngineError;
use crate::event::{Event, Lineage};
use crate::factory_set::FactorySet;
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, ArrowStatus};
use crate::pool::Pool;

use super::Arrow;

/// Identity for a timeslice's lineage, stable for as long as the
/// corresponding `Arc<Lineage>` is alive.
fn lineage_key(lineage: &Arc<Lineage>) -> usize {
    Arc::as_ptr(lineage) as usize
}

/// Same invariant-violation-vs-user-error split as `map_arrow::is_fatal`:
/// a missing/cyclic/mistyped factory dependency aborts the run, a plain
/// user callback failure is logged and the child is dropped.
fn is_fatal(err: &FactoryError) -> bool {
    matches!(
        err,
        FactoryError::Missing { .. } | FactoryError::Cycle { .. } | FactoryError::TypeMismatch { .. }
    )
}

struct PendingParent<P> {
    event: Event<P>,
    lineage: Arc<Lineage>,
}

/// Accumulates child results back onto the parent timeslice that produced
/// them, the inverse of [`super::UnfoldArrow`].
///
/// Sequential. Children may arrive (via `child_input`, the last Map
/// arrow's output) before or after their parent (via `parent_input`,
/// pushed once `UnfoldArrow` has emitted every child); both orderings are
/// buffered against a lineage-keyed table so folding proceeds correctly
/// either way.
pub struct FoldArrow<P, C, F>
where
    F: Folder<Parent = P, Child = C>,
{
    name: String,
    parent_input: Arc<Mailbox<Event<P>>>,
    child_input: Arc<Mailbox<Event<C>>>,
    output: Arc<Mailbox<Event<P>>>,
    child_pool: Arc<Pool<Event<C>>>,
    factory_pool: Arc<Pool<FactorySet>>,
    folder: PlMutex<F>,
    parents: PlMutex<HashMap<usize, PendingParent<P>>>,
    orphan_children: PlMutex<HashMap<usize, Vec<Event<C>>>>,
    upstream_exhausted: AtomicBool,
    fatal: PlMutex<Option<EngineError>>,
    metrics: ArrowMetrics,
}

impl<P: Send + 'static, C: Send + 'static, F> FoldArrow<P, C, F>
where
    F: Folder<Parent = P, Child = C>,
{
    pub fn new(
        name: impl Into<String>,
        parent_input: Arc<Mailbox<Event<P>>>,
        child_input: Arc<Mailbox<Event<C>>>,
        output: Arc<Mailbox<Event<P>>>,
        child_pool: Arc<Pool<Event<C>>>,
        factory_pool: Arc<Pool<FactorySet>>,
        folder: F,
    ) -> Self {
        Self {
            name: name.into(),
            parent_input,
            child_input,
            output,
            child_pool,
            factory_pool,
            folder: PlMutex::new(folder),
            parents: PlMutex::new(HashMap::new()),
            orphan_children: PlMutex::new(HashMap::new()),
            upstream_exhausted: AtomicBool::new(false),
            fatal: PlMutex::new(None),
            metrics: ArrowMetrics::new(),
        }
    }

    fn release_child(&self, mut child: Event<C>, loc: LocationId) {
        let factories = child.take_factories().expect("child carries factory set");
        factories.release_event();
        self.factory_pool.put(factories, loc);
        self.child_pool.put(child, loc);
    }

    /// Fold one child onto its registered parent. Returns `Some(parent)`
    /// if this was the last outstanding child for that parent. A
    /// `FactoryMissing`/`FactoryCycle`/type-mismatch from the folder's own
    /// `event.get` calls is fatal (spec.md §7); a plain `UserError` is
    /// logged and the child's contribution is simply dropped, same as
    /// `MapArrow`/`UnfoldArrow`.
    fn fold_one(&self, parent: &mut P, child: &Event<C>, lineage: &Arc<Lineage>) -> FoldStatus {
        let view = child.view();
        let status = match self.folder.lock().fold(parent, &child.payload, &view) {
            Ok(status) => status,
            Err(err) => {
                if is_fatal(&err) {
                    *self.fatal.lock() = Some(EngineError::Factory(err));
                } else {
                    tracing::warn!(error = %err, "fold user callback failed");
                }
                FoldStatus::KeepGoing
            }
        };
        let last_child = lineage.release_child();
        if last_child {
            FoldStatus::Finished
        } else {
            status
        }
    }
}

impl<P: Send + Sync + 'static, C: Send + Sync + 'static, F> Arrow for FoldArrow<P, C, F>
where
    F: Folder<Parent = P, Child = C> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_parallel(&self) -> bool {
        false
    }

    fn metrics(&self) -> &ArrowMetrics {
        &self.metrics
    }

    fn is_finished(&self) -> bool {
        self.upstream_exhausted.load(Ordering::Acquire)
            && self.parent_input.size() == 0
            && self.child_input.size() == 0
            && self.parents.lock().is_empty()
            && self.orphan_children.lock().is_empty()
    }

    fn mark_finished(&self) {
        self.upstream_exhausted.store(true, Ordering::Release);
    }

    fn take_fatal_error(&self) -> Option<EngineError> {
        self.fatal.lock().take()
    }

    fn execute(&self, loc: LocationId) -> ArrowStatus {
        let start = Instant::now();

        if self.output.reserve(1, loc) == 0 {
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        }

        let (child_popped, _) = self.child_input.pop(loc);
        if let Some(child) = child_popped {
            let process_start = Instant::now();
            let lineage = child
                .lineage()
                .cloned()
                .expect("child event carries lineage back-reference");
            let key = lineage_key(&lineage);

            let mut parents = self.parents.lock();
            let finished_parent = if let Some(entry) = parents.get_mut(&key) {
                let status = self.fold_one(&mut entry.event.payload, &child, &lineage);
                self.release_child(child, loc);
                let result = matches!(status, FoldStatus::Finished).then(|| parents.remove(&key).unwrap());
                drop(parents);
                result
            } else {
                drop(parents);
                self.orphan_children
                    .lock()
                    .entry(key)
                    .or_default()
                    .push(child);
                None
            };
            let latency = process_start.elapsed();

            let status = if let Some(parent) = finished_parent {
                self.output
                    .push(parent.event, loc)
                    .expect("reserved slot guarantees push succeeds");
                ArrowStatus::KeepGoing
            } else {
                self.output.cancel_reservation(1);
                ArrowStatus::KeepGoing
            };
            let overhead = start.elapsed().saturating_sub(latency);
            self.metrics.record(status, latency, overhead);
            return status;
        }

        let (parent_popped, _) = self.parent_input.pop(loc);
        if let Some(parent_event) = parent_popped {
            let process_start = Instant::now();
            let lineage = parent_event
                .lineage()
                .cloned()
                .expect("parent event carries its own lineage");
            let key = lineage_key(&lineage);

            let mut entry = PendingParent {
                event: parent_event,
                lineage: lineage.clone(),
            };
            let buffered = self.orphan_children.lock().remove(&key);
            let mut finished = lineage.pending() == 0;
            if let Some(children) = buffered {
                for child in children {
                    let status = self.fold_one(&mut entry.event.payload, &child, &lineage);
                    self.release_child(child, loc);
                    if matches!(status, FoldStatus::Finished) {
                        finished = true;
                    }
                }
            }
            let latency = process_start.elapsed();

            let status = if finished {
                self.output
                    .push(entry.event, loc)
                    .expect("reserved slot guarantees push succeeds");
                ArrowStatus::KeepGoing
            } else {
                self.parents.lock().insert(key, entry);
                self.output.cancel_reservation(1);
                ArrowStatus::KeepGoing
            };
            let overhead = start.elapsed().saturating_sub(latency);
            self.metrics.record(status, latency, overhead);
            return status;
        }

        self.output.cancel_reservation(1);
        self.metrics
            .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
        ArrowStatus::ComeBackLater
    }
}
