use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex as PlMutex;

use jana_contracts::{FactoryError, LocationId};

use crate::error::EngineError;
use crate::event::Event;
use crate::factory_set::FactorySet;
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, ArrowStatus};
use crate::pool::Pool;

use super::Arrow;

/// A closure run against one event's [`jana_contracts::EventView`] to
/// eagerly force a factory the topology wants computed for every event
/// (as opposed to lazily on a processor's first `Get`).
pub type Trigger<T> = Box<dyn Fn(&jana_contracts::EventView) -> Result<(), FactoryError> + Send + Sync>;

/// Runs the user's factory chain for one event. Parallel: many workers
/// may be inside `execute` concurrently, each holding a distinct event.
pub struct MapArrow<T> {
    name: String,
    input: Arc<Mailbox<Event<T>>>,
    output: Arc<Mailbox<Event<T>>>,
    event_pool: Arc<Pool<Event<T>>>,
    factory_pool: Arc<Pool<FactorySet>>,
    triggers: Vec<Trigger<T>>,
    upstream_exhausted: AtomicBool,
    fatal: PlMutex<Option<EngineError>>,
    metrics: ArrowMetrics,
}

impl<T> MapArrow<T> {
    pub fn new(
        name: impl Into<String>,
        input: Arc<Mailbox<Event<T>>>,
        output: Arc<Mailbox<Event<T>>>,
        event_pool: Arc<Pool<Event<T>>>,
        factory_pool: Arc<Pool<FactorySet>>,
        triggers: Vec<Trigger<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            event_pool,
            factory_pool,
            triggers,
            upstream_exhausted: AtomicBool::new(false),
            fatal: PlMutex::new(None),
            metrics: ArrowMetrics::new(),
        }
    }
}

/// `FactoryMissing`/`FactoryCycle`/a type mismatch are programmer-error
/// invariant violations (spec.md §7): the run aborts rather than retrying
/// forever. A `User` callback error is logged and the offending event is
/// dropped (released back to its pools), same as Sink/Unfold/Fold.
fn is_fatal(err: &FactoryError) -> bool {
    matches!(
        err,
        FactoryError::Missing { .. } | FactoryError::Cycle { .. } | FactoryError::TypeMismatch { .. }
    )
}

impl<T: Send + Sync> Arrow for MapArrow<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_parallel(&self) -> bool {
        true
    }

    fn metrics(&self) -> &ArrowMetrics {
        &self.metrics
    }

    fn is_finished(&self) -> bool {
        self.upstream_exhausted.load(Ordering::Acquire) && self.input.size() == 0
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
            self.metrics.record(
                ArrowStatus::ComeBackLater,
                std::time::Duration::ZERO,
                start.elapsed(),
            );
            return ArrowStatus::ComeBackLater;
        }

        let (popped, pop_status) = self.input.pop(loc);
        let Some(mut event) = popped else {
            self.output.cancel_reservation(1);
            let _ = pop_status;
            self.metrics.record(
                ArrowStatus::ComeBackLater,
                std::time::Duration::ZERO,
                start.elapsed(),
            );
            return ArrowStatus::ComeBackLater;
        };

        let process_start = Instant::now();
        let outcome = (|| -> Result<(), FactoryError> {
            let view = event.view();
            for trigger in &self.triggers {
                trigger(&view)?;
            }
            Ok(())
        })();
        let latency = process_start.elapsed();

        let status = match &outcome {
            Ok(()) => {
                self.output
                    .push(event, loc)
                    .expect("reserved slot guarantees push succeeds");
                ArrowStatus::KeepGoing
            }
            Err(err) => {
                if is_fatal(err) {
                    *self.fatal.lock() = Some(EngineError::Factory(err.clone()));
                } else {
                    tracing::warn!(
                        event_number = %event.event_number(),
                        error = %err,
                        "factory user callback failed; dropping event"
                    );
                }
                // Per spec.md §7 the offending event is dropped, not
                // forwarded: re-`Get`ting a factory on a forwarded event
                // would re-run `process()` (factory_set.rs's
                // `processed_event` is only set on `Ok`), violating the
                // at-most-once invariant. Release it back to its pools
                // instead, same as Sink/Unfold/Fold already do on error.
                self.output.cancel_reservation(1);
                if let Some(factories) = event.take_factories() {
                    factories.release_event();
                    self.factory_pool.put(factories, loc);
                }
                self.event_pool.put(event, loc);
                ArrowStatus::Error
            }
        };

        let overhead = start.elapsed().saturating_sub(latency);
        self.metrics.record(status, latency, overhead);
        status
    }
}
