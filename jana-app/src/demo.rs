//! Built-in demo pipeline. `jana-app` has no plugin loader (spec.md §6's
//! Non-goals exclude dynamic plugin discovery for this exercise), so the
//! only way to exercise the engine end to end is a pipeline baked into the
//! binary itself. This one is deliberately the simplest shape the engine
//! supports: a single source, one factory, one processor, matching the
//! "counter under the global lock" scenario the engine's own properties
//! are checked against.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use jana_contracts::{
    EventNumber, EventView, Factory, FactoryError, Processor, RunNumber, SourceStatus,
};
use jana_core::{FactoryCatalog, OutputLock, ServiceRegistry};

/// Emits events numbered `1..=count`, one per `next` call, then reports
/// `Finished`. No timeslicing: every event is a standalone physics event.
pub struct CountingSource {
    count: u64,
    emitted: u64,
}

impl CountingSource {
    pub fn new(count: u64) -> Self {
        Self { count, emitted: 0 }
    }
}

impl jana_contracts::EventSource for CountingSource {
    type Item = u64;

    fn next(
        &mut self,
        slot: &mut u64,
    ) -> Result<(SourceStatus, EventNumber, RunNumber), String> {
        if self.emitted >= self.count {
            return Ok((SourceStatus::Finished, EventNumber(0), RunNumber(0)));
        }
        self.emitted += 1;
        *slot = self.emitted;
        Ok((SourceStatus::Success, EventNumber(self.emitted), RunNumber(1)))
    }
}

/// Doubles the event's payload. Exists purely so the demo pipeline has a
/// factory stage to exercise `init`/`change_run`/`process` bookkeeping,
/// not because doubling means anything physically.
#[derive(Default)]
pub struct DoublingFactory {
    result: Vec<u64>,
}

impl Factory for DoublingFactory {
    type Output = u64;

    fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
        let payload = event.event_number().0;
        self.result = vec![payload * 2];
        Ok(())
    }

    fn results(&self) -> &[Self::Output] {
        &self.result
    }

    fn clear(&mut self) {
        self.result.clear();
    }
}

pub fn catalog() -> FactoryCatalog {
    FactoryCatalog::new().register(DoublingFactory::default)
}

/// Increments a shared counter under the registered [`OutputLock`] for
/// every event that reaches the sink. Pulls the doubled value through
/// `event.get` so the factory actually runs, then discards it: the point
/// of this processor is the side effect, not the number.
pub struct CountingProcessor {
    counter: Arc<AtomicU64>,
    services: Arc<ServiceRegistry>,
}

impl CountingProcessor {
    pub fn new(counter: Arc<AtomicU64>, services: Arc<ServiceRegistry>) -> Self {
        Self { counter, services }
    }
}

impl Processor for CountingProcessor {
    fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
        let _doubled = event.get_untagged::<u64>()?;
        let lock = self
            .services
            .get::<OutputLock>()
            .expect("OutputLock must be registered before the pipeline runs");
        lock.with_lock(|| {
            self.counter.fetch_add(1, Ordering::AcqRel);
        });
        Ok(())
    }
}
