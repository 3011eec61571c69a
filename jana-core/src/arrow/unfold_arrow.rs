use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;

use jana_contracts::{EventNumber, FactoryError, LocationId, UnfoldStatus, Unfolder};

use crate::error::EngineError;
use crate::event::{Event, Lineage};
use crate::factory_set::FactorySet;
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, ArrowStatus};
use crate::pool::Pool;

use super::Arrow;

/// The parent timeslice currently being unfolded, plus the lineage handed
/// to its children.
struct CurrentParent<P> {
    event: Event<P>,
    lineage: Arc<Lineage>,
}

/// Splits a parent timeslice into its constituent physics events.
///
/// Sequential: at most one worker is ever inside `execute` for a given
/// `UnfoldArrow`, so `current_parent` needs no more than a mutex to stay
/// correct, not a lock-free structure. Each call emits at most one child;
/// the same parent is revisited across calls until the user's `unfold`
/// reports [`UnfoldStatus::Finished`], at which point the parent is handed
/// to `parent_output` for the corresponding [`super::FoldArrow`] to track.
pub struct UnfoldArrow<P, C, U>
where
    U: Unfolder<Parent = P, Child = C>,
{
    name: String,
    input: Arc<Mailbox<Event<P>>>,
    child_output: Arc<Mailbox<Event<C>>>,
    parent_output: Arc<Mailbox<Event<P>>>,
    child_pool: Arc<Pool<Event<C>>>,
    factory_pool: Arc<Pool<FactorySet>>,
    unfolder: PlMutex<U>,
    current_parent: PlMutex<Option<CurrentParent<P>>>,
    /// Set once the user's `unfold` has reported `Finished` for
    /// `current_parent` but `release_parent` couldn't push it (output
    /// backpressure). While set, `execute` retries only the release, never
    /// calling `unfold` again on an already-finished parent.
    pending_release: AtomicBool,
    next_child_number: AtomicU64,
    upstream_exhausted: AtomicBool,
    fatal: PlMutex<Option<EngineError>>,
    metrics: ArrowMetrics,
}

/// Same invariant-violation-vs-user-error split as `map_arrow::is_fatal`:
/// a missing/cyclic/mistyped factory dependency aborts the run, a plain
/// user callback failure is logged and the child is simply dropped.
fn is_fatal(err: &FactoryError) -> bool {
    matches!(
        err,
        FactoryError::Missing { .. } | FactoryError::Cycle { .. } | FactoryError::TypeMismatch { .. }
    )
}

impl<P: Send + 'static, C: Send + 'static, U> UnfoldArrow<P, C, U>
where
    U: Unfolder<Parent = P, Child = C>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        input: Arc<Mailbox<Event<P>>>,
        child_output: Arc<Mailbox<Event<C>>>,
        parent_output: Arc<Mailbox<Event<P>>>,
        child_pool: Arc<Pool<Event<C>>>,
        factory_pool: Arc<Pool<FactorySet>>,
        unfolder: U,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            child_output,
            parent_output,
            child_pool,
            factory_pool,
            unfolder: PlMutex::new(unfolder),
            current_parent: PlMutex::new(None),
            pending_release: AtomicBool::new(false),
            next_child_number: AtomicU64::new(0),
            upstream_exhausted: AtomicBool::new(false),
            fatal: PlMutex::new(None),
            metrics: ArrowMetrics::new(),
        }
    }

    /// Release the current parent (no more children to emit) by handing it
    /// to `parent_output`. Returns `true` if delivered, `false` if the
    /// parent-side mailbox is full (caller retries on a later call).
    fn release_parent(&self, loc: LocationId) -> bool {
        if self.parent_output.reserve(1, loc) == 0 {
            return false;
        }
        let Some(current) = self.current_parent.lock().take() else {
            self.parent_output.cancel_reservation(1);
            return true;
        };
        self.parent_output
            .push(current.event, loc)
            .expect("reserved slot guarantees push succeeds");
        true
    }
}

impl<P: Send + Sync + 'static, C: Send + Sync + 'static, U> Arrow for UnfoldArrow<P, C, U>
where
    U: Unfolder<Parent = P, Child = C> + Send + Sync,
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
        self.upstream_exhausted.load(Ordering::Acquire) && self.current_parent.lock().is_none()
    }

    fn mark_finished(&self) {
        self.upstream_exhausted.store(true, Ordering::Release);
    }

    fn take_fatal_error(&self) -> Option<EngineError> {
        self.fatal.lock().take()
    }

    fn execute(&self, loc: LocationId) -> ArrowStatus {
        let start = Instant::now();

        // The previous call already finished unfolding `current_parent`
        // and is only waiting for `parent_output` to have room; retry just
        // the release, not another `unfold()` call on a finished parent.
        if self.pending_release.load(Ordering::Acquire) {
            let status = if self.release_parent(loc) {
                self.pending_release.store(false, Ordering::Release);
                ArrowStatus::KeepGoing
            } else {
                ArrowStatus::ComeBackLater
            };
            self.metrics
                .record(status, Duration::ZERO, start.elapsed());
            return status;
        }

        if self.current_parent.lock().is_none() {
            let (popped, _) = self.input.pop(loc);
            let Some(mut parent) = popped else {
                self.metrics
                    .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
                return ArrowStatus::ComeBackLater;
            };
            let lineage = Lineage::new();
            // The parent carries the same lineage handle its children get,
            // so FoldArrow can key its pending-parent table off it too
            // (see fold_arrow.rs's use of `lineage_key`).
            parent.attach_lineage(lineage.clone());
            *self.current_parent.lock() = Some(CurrentParent {
                event: parent,
                lineage,
            });
        }

        if self.child_output.reserve(1, loc) == 0 {
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        }
        let Some(mut child) = self.child_pool.get(loc) else {
            self.child_output.cancel_reservation(1);
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        };
        let Some(factories) = self.factory_pool.get(loc) else {
            self.child_pool.put(child, loc);
            self.child_output.cancel_reservation(1);
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        };
        child.attach_factories(factories);

        let process_start = Instant::now();
        let child_number = EventNumber(self.next_child_number.fetch_add(1, Ordering::AcqRel));
        let outcome = {
            let guard = self.current_parent.lock();
            let current = guard.as_ref().expect("parent present, checked above");
            let parent_view = current.event.view();
            self.unfolder.lock().unfold(
                &current.event.payload,
                &parent_view,
                &mut child.payload,
                child_number,
            )
        };
        let latency = process_start.elapsed();

        let status = match outcome {
            Ok(UnfoldStatus::KeepGoing) => {
                let (run_number, level, source_name, lineage) = {
                    let guard = self.current_parent.lock();
                    let current = guard.as_ref().expect("parent present, checked above");
                    (
                        current.event.run_number(),
                        current.event.level(),
                        Arc::from(current.event.get_event_source()),
                        current.lineage.clone(),
                    )
                };
                child.reset(child_number, run_number, level, source_name);
                lineage.add_child();
                child.attach_lineage(lineage);
                self.child_output
                    .push(child, loc)
                    .expect("reserved slot guarantees push succeeds");
                ArrowStatus::KeepGoing
            }
            Ok(UnfoldStatus::Finished) => {
                let factories = child.take_factories().expect("just attached");
                factories.release_event();
                self.factory_pool.put(factories, loc);
                self.child_pool.put(child, loc);
                self.child_output.cancel_reservation(1);
                if self.release_parent(loc) {
                    ArrowStatus::KeepGoing
                } else {
                    self.pending_release.store(true, Ordering::Release);
                    ArrowStatus::ComeBackLater
                }
            }
            Err(err) => {
                let factories = child.take_factories().expect("just attached");
                factories.release_event();
                self.factory_pool.put(factories, loc);
                self.child_pool.put(child, loc);
                self.child_output.cancel_reservation(1);
                if is_fatal(&err) {
                    *self.fatal.lock() = Some(EngineError::Factory(err));
                } else {
                    tracing::warn!(
                        child_number = %child_number,
                        error = %err,
                        "unfold user callback failed"
                    );
                }
                ArrowStatus::Error
            }
        };

        let overhead = start.elapsed().saturating_sub(latency);
        self.metrics.record(status, latency, overhead);
        status
    }
}
