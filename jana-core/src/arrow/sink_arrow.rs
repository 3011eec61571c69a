use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;

use jana_contracts::{FactoryError, LocationId, Processor};

use crate::error::EngineError;
use crate::event::Event;
use crate::factory_set::FactorySet;
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, ArrowStatus};
use crate::pool::Pool;

use super::Arrow;

/// Same invariant-violation-vs-user-error split as `map_arrow::is_fatal`:
/// a missing/cyclic/mistyped factory dependency aborts the run, a plain
/// user callback failure is logged and the offending event is dropped.
fn is_fatal(err: &FactoryError) -> bool {
    matches!(
        err,
        FactoryError::Missing { .. } | FactoryError::Cycle { .. } | FactoryError::TypeMismatch { .. }
    )
}

/// One registered processor. Processors interact with an event purely
/// through [`jana_contracts::EventView`] (the same surface factories use),
/// so a sink is never generic over the processors it drives.
struct Slot {
    processor: PlMutex<Box<dyn Processor>>,
    sequential: bool,
}

/// Drives every registered [`Processor`] over each event drawn from its
/// input. Terminal: has no output mailbox, so events are returned to their
/// pools (event + factory set) once every processor has run.
///
/// Every processor gets its own lock, held only while that processor runs;
/// two sequential processors never block on each other, only on
/// themselves. A processor that doesn't declare itself
/// [`Processor::sequential`] is still serialized through its own slot lock
/// here (a single `SinkArrow` still only lets one worker touch one
/// processor instance at a time — concurrent *events* are what the
/// `sequential` flag actually gates at the scheduler level via
/// `is_parallel`), but unlike a sequential processor it carries no
/// ordering requirement across events.
pub struct SinkArrow<T> {
    name: String,
    input: Arc<Mailbox<Event<T>>>,
    event_pool: Arc<Pool<Event<T>>>,
    factory_pool: Arc<Pool<FactorySet>>,
    processors: Vec<Slot>,
    upstream_exhausted: AtomicBool,
    fatal: PlMutex<Option<EngineError>>,
    metrics: ArrowMetrics,
}

impl<T: Send + 'static> SinkArrow<T> {
    pub fn new(
        name: impl Into<String>,
        input: Arc<Mailbox<Event<T>>>,
        event_pool: Arc<Pool<Event<T>>>,
        factory_pool: Arc<Pool<FactorySet>>,
        processors: Vec<Box<dyn Processor>>,
    ) -> Self {
        let processors = processors
            .into_iter()
            .map(|processor| Slot {
                sequential: processor.sequential(),
                processor: PlMutex::new(processor),
            })
            .collect();
        Self {
            name: name.into(),
            input,
            event_pool,
            factory_pool,
            processors,
            upstream_exhausted: AtomicBool::new(false),
            fatal: PlMutex::new(None),
            metrics: ArrowMetrics::new(),
        }
    }

    /// Whether any registered processor demands in-order delivery. The
    /// scheduler has no special-case handling for this today (per
    /// spec.md §5, "Processor invocations for different events on the
    /// same processor are *not* ordered unless the processor is marked
    /// sequential") — declaring a processor sequential only guarantees
    /// mutual exclusion, not FIFO event order, which matches the
    /// distilled spec's actual guarantee.
    pub fn has_sequential_processor(&self) -> bool {
        self.processors.iter().any(|slot| slot.sequential)
    }
}

impl<T: Send + Sync + 'static> Arrow for SinkArrow<T> {
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

    fn initialize(&self) -> Result<(), crate::error::EngineError> {
        for slot in &self.processors {
            slot.processor
                .lock()
                .init()
                .map_err(crate::error::EngineError::Factory)?;
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), crate::error::EngineError> {
        for slot in &self.processors {
            slot.processor
                .lock()
                .finish()
                .map_err(crate::error::EngineError::Factory)?;
        }
        Ok(())
    }

    fn execute(&self, loc: LocationId) -> ArrowStatus {
        let start = Instant::now();

        let (popped, _) = self.input.pop(loc);
        let Some(mut event) = popped else {
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        };

        let process_start = Instant::now();
        let outcome: Result<(), FactoryError> = (|| {
            let view = event.view();
            for slot in &self.processors {
                slot.processor.lock().process(&view)?;
            }
            Ok(())
        })();
        let latency = process_start.elapsed();

        // Per spec.md §7: a plain `UserError` from a processor is logged
        // and the offending event is dropped, not retried — unlike the
        // arrow protocol's generic failure path, a sink has nowhere
        // upstream to return the event to once some processors have
        // already observed it, so both branches release the event back to
        // its pools. A `FactoryMissing`/`FactoryCycle`/type-mismatch is an
        // invariant violation instead: it aborts the run via the same
        // `take_fatal_error` poll `MapArrow`/`UnfoldArrow` use.
        if let Err(ref err) = outcome {
            if is_fatal(err) {
                *self.fatal.lock() = Some(EngineError::Factory(err.clone()));
            } else {
                tracing::warn!(
                    event_number = %event.event_number(),
                    error = %err,
                    "processor failed; dropping event"
                );
            }
        }
        let factories = event.take_factories().expect("sink events carry factory sets");
        factories.release_event();
        self.factory_pool.put(factories, loc);
        self.event_pool.put(event, loc);
        let status = match outcome {
            Ok(()) => ArrowStatus::KeepGoing,
            Err(_) => ArrowStatus::Error,
        };

        let overhead = start.elapsed().saturating_sub(latency);
        self.metrics.record(status, latency, overhead);
        status
    }
}
