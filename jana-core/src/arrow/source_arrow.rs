use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;

use jana_contracts::{EventSource, LocationId, SourceStatus};

use crate::error::EngineError;
use crate::event::Event;
use crate::factory_set::FactorySet;
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, ArrowStatus};
use crate::pool::Pool;

use super::Arrow;

/// Wraps a user [`EventSource`]: draws a fresh event from `event_pool`,
/// attaches a factory set from `factory_pool`, and pushes the result to
/// `output`. Sequential — the scheduler assigns at most one worker to
/// this arrow at a time.
pub struct SourceArrow<S: EventSource> {
    name: String,
    source_name: Arc<str>,
    source: PlMutex<S>,
    event_pool: Arc<Pool<Event<S::Item>>>,
    factory_pool: Arc<Pool<FactorySet>>,
    output: Arc<Mailbox<Event<S::Item>>>,
    finished: AtomicBool,
    events_emitted: AtomicU64,
    metrics: ArrowMetrics,
}

impl<S: EventSource> SourceArrow<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        event_pool: Arc<Pool<Event<S::Item>>>,
        factory_pool: Arc<Pool<FactorySet>>,
        output: Arc<Mailbox<Event<S::Item>>>,
    ) -> Self {
        let name = name.into();
        Self {
            source_name: Arc::from(name.as_str()),
            name,
            source: PlMutex::new(source),
            event_pool,
            factory_pool,
            output,
            finished: AtomicBool::new(false),
            events_emitted: AtomicU64::new(0),
            metrics: ArrowMetrics::new(),
        }
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Acquire)
    }

    /// Return an event (with its attached factory set) to their respective
    /// pools on every non-success path, so a `ComeBackLater`/`Finished`/
    /// `Error` outcome never leaks a `factory_pool` slot.
    fn release_unused(&self, mut event: Event<S::Item>, loc: LocationId) {
        if let Some(factories) = event.take_factories() {
            factories.release_event();
            self.factory_pool.put(factories, loc);
        }
        self.event_pool.put(event, loc);
    }
}

impl<S: EventSource> Arrow for SourceArrow<S> {
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
        self.finished.load(Ordering::Acquire)
    }

    fn initialize(&self) -> Result<(), EngineError> {
        self.source
            .lock()
            .open()
            .map_err(|reason| EngineError::SourceOpen {
                name: self.name.clone(),
                reason,
            })
    }

    fn execute(&self, loc: LocationId) -> ArrowStatus {
        if self.finished.load(Ordering::Acquire) {
            return ArrowStatus::Finished;
        }

        let start = Instant::now();

        if self.output.reserve(1, loc) == 0 {
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        }

        let Some(mut event) = self.event_pool.get(loc) else {
            self.output.cancel_reservation(1);
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        };
        let Some(factories) = self.factory_pool.get(loc) else {
            self.output.cancel_reservation(1);
            self.event_pool.put(event, loc);
            self.metrics
                .record(ArrowStatus::ComeBackLater, Duration::ZERO, start.elapsed());
            return ArrowStatus::ComeBackLater;
        };
        event.attach_factories(factories);

        let process_start = Instant::now();
        let (source_result, level) = {
            let mut source = self.source.lock();
            (source.next(&mut event.payload), source.level())
        };
        let latency = process_start.elapsed();

        let status = match source_result {
            Ok((SourceStatus::Success, event_number, run_number)) => {
                event.reset(event_number, run_number, level, self.source_name.clone());
                self.output
                    .push(event, loc)
                    .expect("reserved slot guarantees push succeeds");
                self.events_emitted.fetch_add(1, Ordering::AcqRel);
                ArrowStatus::KeepGoing
            }
            Ok((SourceStatus::ComeBackLater, _, _)) => {
                self.output.cancel_reservation(1);
                self.release_unused(event, loc);
                ArrowStatus::ComeBackLater
            }
            Ok((SourceStatus::Finished, _, _)) => {
                self.output.cancel_reservation(1);
                self.release_unused(event, loc);
                self.finished.store(true, Ordering::Release);
                ArrowStatus::Finished
            }
            Err(_reason) => {
                self.output.cancel_reservation(1);
                self.release_unused(event, loc);
                ArrowStatus::Error
            }
        };

        let overhead = start.elapsed().saturating_sub(latency);
        self.metrics.record(status, latency, overhead);
        status
    }
}
