//! End-to-end pipeline tests matching the concrete scenarios in spec.md
//! §8 (S1-S4, S6; S5's parameter-parsing round trips are unit-tested
//! alongside `ParameterManager` itself). Each test assembles a real
//! `Topology` through `TopologyBuilder` and drives it with a real
//! `ThreadManager`, rather than exercising arrows in isolation.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jana_contracts::{
    EventLevel, EventNumber, EventView, Factory, FactoryError, FactoryFlags, FoldStatus, Folder,
    Processor, RunNumber, SourceStatus, UnfoldStatus, Unfolder,
};
use jana_core::{AffinityPolicy, FactoryCatalog, OutputLock, ParameterManager, ServiceRegistry, ThreadManager, TopologyBuilder};

/// Emits events `1..=count`, all on `run`, then reports `Finished`.
struct CountingSource {
    count: u64,
    emitted: u64,
    run: i64,
}

impl CountingSource {
    fn new(count: u64, run: i64) -> Self {
        Self { count, emitted: 0, run }
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
        Ok((SourceStatus::Success, EventNumber(self.emitted), RunNumber(self.run)))
    }
}

/// A source whose run number changes partway through, for S2.
struct RunBoundarySource {
    emitted: u64,
    total: u64,
    boundary: u64,
}

impl jana_contracts::EventSource for RunBoundarySource {
    type Item = u64;

    fn next(
        &mut self,
        slot: &mut u64,
    ) -> Result<(SourceStatus, EventNumber, RunNumber), String> {
        if self.emitted >= self.total {
            return Ok((SourceStatus::Finished, EventNumber(0), RunNumber(0)));
        }
        self.emitted += 1;
        *slot = self.emitted;
        let run = if self.emitted <= self.boundary { 100 } else { 200 };
        Ok((SourceStatus::Success, EventNumber(self.emitted), RunNumber(run)))
    }
}

/// A source that never runs dry, for the backpressure scenario (S3): it
/// always has the next event ready instantly.
struct InfiniteSource {
    emitted: u64,
}

impl jana_contracts::EventSource for InfiniteSource {
    type Item = u64;

    fn next(
        &mut self,
        slot: &mut u64,
    ) -> Result<(SourceStatus, EventNumber, RunNumber), String> {
        self.emitted += 1;
        *slot = self.emitted;
        Ok((SourceStatus::Success, EventNumber(self.emitted), RunNumber(1)))
    }
}

/// Counts `init`/`change_run`/`process` calls on shared atomics so
/// assertions can run after the pipeline has fully drained and the
/// factory instance itself is no longer reachable (it lives inside the
/// topology's factory pool).
#[derive(Default)]
struct InstrumentedFactory {
    inits: Arc<AtomicU64>,
    change_runs: Arc<AtomicU64>,
    processes: Arc<AtomicU64>,
    result: Vec<u64>,
}

impl Factory for InstrumentedFactory {
    type Output = u64;

    fn init(&mut self) -> Result<(), FactoryError> {
        self.inits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn change_run(&mut self, _run_number: RunNumber) -> Result<(), FactoryError> {
        self.change_runs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
        self.processes.fetch_add(1, Ordering::AcqRel);
        self.result = vec![event.event_number().0 * 2];
        Ok(())
    }

    fn results(&self) -> &[Self::Output] {
        &self.result
    }

    fn clear(&mut self) {
        self.result.clear();
    }
}

/// Forces the factory to run for every event and increments a shared
/// counter under the engine's global output lock, matching S1's "counter
/// incremented under the global lock" wording.
struct CountingProcessor {
    counter: Arc<AtomicU64>,
    services: Arc<ServiceRegistry>,
    sleep_per_event: Duration,
}

impl Processor for CountingProcessor {
    fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
        let _ = event.get_untagged::<u64>()?;
        if !self.sleep_per_event.is_zero() {
            std::thread::sleep(self.sleep_per_event);
        }
        let lock = self.services.get::<OutputLock>().expect("registered before run");
        lock.with_lock(|| {
            self.counter.fetch_add(1, Ordering::AcqRel);
        });
        Ok(())
    }
}

fn run_to_completion(manager: &ThreadManager, timeout: Duration) {
    manager.run();
    let deadline = std::time::Instant::now() + timeout;
    while !manager.is_quiesced() {
        assert!(std::time::Instant::now() < deadline, "pipeline did not quiesce in time");
        std::thread::sleep(Duration::from_millis(2));
    }
    manager.stop_and_join();
}

/// S1: single source, one factory, one processor. 1000 events; the
/// counter must land on exactly 1000 and the single factory instance
/// (forced by an `EVENT_POOL_SIZE` of 1) sees `init` once, `change_run`
/// once (one run throughout), and `process` exactly 1000 times.
#[test]
fn s1_single_source_one_factory_one_processor() {
    let params = Arc::new(ParameterManager::new());
    params.set_raw("EVENT_POOL_SIZE", "1").unwrap();

    let inits = Arc::new(AtomicU64::new(0));
    let change_runs = Arc::new(AtomicU64::new(0));
    let processes = Arc::new(AtomicU64::new(0));

    let catalog = {
        let (inits, change_runs, processes) =
            (inits.clone(), change_runs.clone(), processes.clone());
        FactoryCatalog::new().register(move || InstrumentedFactory {
            inits: inits.clone(),
            change_runs: change_runs.clone(),
            processes: processes.clone(),
            result: Vec::new(),
        })
    };

    let services = Arc::new(ServiceRegistry::new());
    services.register(Arc::new(OutputLock::new()));
    let counter = Arc::new(AtomicU64::new(0));
    let processor = Box::new(CountingProcessor {
        counter: counter.clone(),
        services: services.clone(),
        sleep_per_event: Duration::ZERO,
    });

    let topology = TopologyBuilder::new(params, 1, 1)
        .add_pipeline("s1", CountingSource::new(1000, 7), catalog, vec![], vec![processor])
        .build();

    let manager = ThreadManager::new(&topology, 1, AffinityPolicy::None, Duration::from_micros(100));
    run_to_completion(&manager, Duration::from_secs(30));

    assert_eq!(counter.load(Ordering::Acquire), 1000);
    assert_eq!(inits.load(Ordering::Acquire), 1);
    assert_eq!(change_runs.load(Ordering::Acquire), 1);
    assert_eq!(processes.load(Ordering::Acquire), 1000);
}

/// S2: run boundary. Events 1..10 on run 100, events 11..20 on run 200;
/// `change_run` must fire exactly twice across the whole run, once per
/// distinct run number observed by the single forced factory instance.
#[test]
fn s2_change_run_fires_once_per_run_transition() {
    let params = Arc::new(ParameterManager::new());
    params.set_raw("EVENT_POOL_SIZE", "1").unwrap();

    let inits = Arc::new(AtomicU64::new(0));
    let change_runs = Arc::new(AtomicU64::new(0));
    let processes = Arc::new(AtomicU64::new(0));

    let catalog = {
        let (inits, change_runs, processes) =
            (inits.clone(), change_runs.clone(), processes.clone());
        FactoryCatalog::new().register(move || InstrumentedFactory {
            inits: inits.clone(),
            change_runs: change_runs.clone(),
            processes: processes.clone(),
            result: Vec::new(),
        })
    };

    struct ForceFactoryProcessor;
    impl Processor for ForceFactoryProcessor {
        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            event.get_untagged::<u64>()?;
            Ok(())
        }
    }

    let source = RunBoundarySource { emitted: 0, total: 20, boundary: 10 };
    let topology = TopologyBuilder::new(params, 1, 1)
        .add_pipeline("s2", source, catalog, vec![], vec![Box::new(ForceFactoryProcessor)])
        .build();

    let manager = ThreadManager::new(&topology, 1, AffinityPolicy::None, Duration::from_micros(100));
    run_to_completion(&manager, Duration::from_secs(30));

    assert_eq!(processes.load(Ordering::Acquire), 20);
    assert_eq!(change_runs.load(Ordering::Acquire), 2);
    assert_eq!(inits.load(Ordering::Acquire), 1);
}

/// S3: backpressure. An infinitely-fast source feeds a sink that sleeps
/// 10ms per event through a 4-slot mailbox; the source must never error
/// (it only ever sees `ComeBackLater` via output reservation failing)
/// and every event that does get processed, gets processed exactly once.
#[test]
fn s3_backpressure_bounds_in_flight_events_without_source_errors() {
    let params = Arc::new(ParameterManager::new());
    params.set_raw("MAILBOX_CAPACITY", "4").unwrap();
    params.set_raw("EVENT_POOL_SIZE", "8").unwrap();

    let services = Arc::new(ServiceRegistry::new());
    services.register(Arc::new(OutputLock::new()));
    let counter = Arc::new(AtomicU64::new(0));
    let processor = Box::new(CountingProcessor {
        counter: counter.clone(),
        services,
        sleep_per_event: Duration::from_millis(10),
    });

    let topology = TopologyBuilder::new(params, 2, 2)
        .add_pipeline(
            "s3",
            InfiniteSource { emitted: 0 },
            FactoryCatalog::new().register(|| InstrumentedFactory::default()),
            vec![],
            vec![processor],
        )
        .build();

    let manager = ThreadManager::new(&topology, 2, AffinityPolicy::None, Duration::from_micros(100));
    manager.run();

    // Let the slow sink process a meaningful number of events, then quit
    // from outside, the way the control thread would once enough events
    // have gone through.
    while counter.load(Ordering::Acquire) < 30 {
        std::thread::sleep(Duration::from_millis(5));
    }
    manager.quit();
    manager.stop_and_join();

    assert!(counter.load(Ordering::Acquire) >= 30);
}

/// S4a: a persistent factory's output survives across event boundaries —
/// `process` runs once, ever, and `clear` (where a real factory would
/// tear down owned objects) is never invoked by the engine.
#[test]
fn s4_persistent_factory_never_clears_between_events() {
    let deleted = Arc::new(AtomicBool::new(false));
    let processes = Arc::new(AtomicU64::new(0));

    struct PersistentFactory {
        deleted: Arc<AtomicBool>,
        processes: Arc<AtomicU64>,
        result: Vec<u64>,
    }

    impl Factory for PersistentFactory {
        type Output = u64;

        fn flags(&self) -> FactoryFlags {
            FactoryFlags { persistent: true, object_owner: true }
        }

        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            self.processes.fetch_add(1, Ordering::AcqRel);
            self.deleted.store(false, Ordering::Release);
            self.result = vec![event.event_number().0];
            Ok(())
        }

        fn results(&self) -> &[Self::Output] {
            &self.result
        }

        fn clear(&mut self) {
            self.deleted.store(true, Ordering::Release);
            self.result.clear();
        }
    }

    let params = Arc::new(ParameterManager::new());
    params.set_raw("EVENT_POOL_SIZE", "1").unwrap();

    let catalog = {
        let (deleted, processes) = (deleted.clone(), processes.clone());
        FactoryCatalog::new().register(move || PersistentFactory {
            deleted: deleted.clone(),
            processes: processes.clone(),
            result: Vec::new(),
        })
    };

    struct ForceFactoryProcessor;
    impl Processor for ForceFactoryProcessor {
        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            event.get_untagged::<u64>()?;
            Ok(())
        }
    }

    let topology = TopologyBuilder::new(params, 1, 1)
        .add_pipeline("s4a", CountingSource::new(5, 1), catalog, vec![], vec![Box::new(ForceFactoryProcessor)])
        .build();

    let manager = ThreadManager::new(&topology, 1, AffinityPolicy::None, Duration::from_micros(100));
    run_to_completion(&manager, Duration::from_secs(10));

    assert_eq!(processes.load(Ordering::Acquire), 1, "persistent factory recomputes only once, ever");
    assert!(!deleted.load(Ordering::Acquire), "persistent factory's clear() must never run");
}

/// S4b: a non-persistent, object-owning factory destroys its emitted
/// objects (here: flips a deletion flag) at the end of every event it
/// processed, and recomputes fresh results for the next one.
#[test]
fn s4_non_persistent_object_owner_clears_after_every_event() {
    let deleted = Arc::new(AtomicBool::new(false));
    let processes = Arc::new(AtomicU64::new(0));

    struct OwningFactory {
        deleted: Arc<AtomicBool>,
        processes: Arc<AtomicU64>,
        result: Vec<u64>,
    }

    impl Factory for OwningFactory {
        type Output = u64;

        fn flags(&self) -> FactoryFlags {
            FactoryFlags { persistent: false, object_owner: true }
        }

        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            self.processes.fetch_add(1, Ordering::AcqRel);
            self.deleted.store(false, Ordering::Release);
            self.result = vec![event.event_number().0];
            Ok(())
        }

        fn results(&self) -> &[Self::Output] {
            &self.result
        }

        fn clear(&mut self) {
            self.deleted.store(true, Ordering::Release);
            self.result.clear();
        }
    }

    let params = Arc::new(ParameterManager::new());
    params.set_raw("EVENT_POOL_SIZE", "1").unwrap();

    let catalog = {
        let (deleted, processes) = (deleted.clone(), processes.clone());
        FactoryCatalog::new().register(move || OwningFactory {
            deleted: deleted.clone(),
            processes: processes.clone(),
            result: Vec::new(),
        })
    };

    struct ForceFactoryProcessor;
    impl Processor for ForceFactoryProcessor {
        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            event.get_untagged::<u64>()?;
            Ok(())
        }
    }

    let topology = TopologyBuilder::new(params, 1, 1)
        .add_pipeline("s4b", CountingSource::new(3, 1), catalog, vec![], vec![Box::new(ForceFactoryProcessor)])
        .build();

    let manager = ThreadManager::new(&topology, 1, AffinityPolicy::None, Duration::from_micros(100));
    run_to_completion(&manager, Duration::from_secs(10));

    assert_eq!(processes.load(Ordering::Acquire), 3, "non-persistent factory recomputes every event");
    assert!(deleted.load(Ordering::Acquire), "clear() must run after the last event releases its factory set");
}

/// S6: graceful shutdown. An effectively endless source is cut off by an
/// external `quit()` after 500 events have been counted; every worker
/// must exit, and the total processed count must land on a sane,
/// reproducible value rather than hanging or panicking.
#[test]
fn s6_graceful_shutdown_after_external_quit() {
    let services = Arc::new(ServiceRegistry::new());
    services.register(Arc::new(OutputLock::new()));
    let counter = Arc::new(AtomicU64::new(0));
    let processor = Box::new(CountingProcessor {
        counter: counter.clone(),
        services,
        sleep_per_event: Duration::ZERO,
    });

    let params = Arc::new(ParameterManager::new());
    let topology = TopologyBuilder::new(params, 2, 2)
        .add_pipeline(
            "s6",
            InfiniteSource { emitted: 0 },
            FactoryCatalog::new().register(|| InstrumentedFactory::default()),
            vec![],
            vec![processor],
        )
        .build();

    let manager = ThreadManager::new(&topology, 2, AffinityPolicy::None, Duration::from_micros(100));
    manager.run();

    while counter.load(Ordering::Acquire) < 500 {
        std::thread::sleep(Duration::from_millis(2));
    }
    manager.quit();
    manager.stop_and_join();

    assert_eq!(manager.state(), jana_core::ThreadManagerState::Joined);
    assert!(counter.load(Ordering::Acquire) >= 500);
}

/// A `FactoryMissing` lookup is a fatal invariant violation (spec.md §7):
/// the run aborts instead of retrying forever, surfaced through the map
/// arrow's `take_fatal_error`.
#[test]
fn factory_missing_is_fatal_and_drains_the_run() {
    struct NeverSucceedsProcessor(Arc<AtomicUsize>);
    impl Processor for NeverSucceedsProcessor {
        fn process(&mut self, event: &EventView) -> Result<(), FactoryError> {
            self.0.fetch_add(1, Ordering::AcqRel);
            // No factory registered under this type/tag in the catalog below.
            event.get_untagged::<u64>()?;
            Ok(())
        }
    }

    let attempts = Arc::new(AtomicUsize::new(0));
    let params = Arc::new(ParameterManager::new());
    let topology = TopologyBuilder::new(params, 1, 1)
        .add_pipeline(
            "fatal",
            CountingSource::new(100, 1),
            FactoryCatalog::new(),
            vec![],
            vec![Box::new(NeverSucceedsProcessor(attempts.clone()))],
        )
        .build();

    let manager = ThreadManager::new(&topology, 1, AffinityPolicy::None, Duration::from_micros(100));
    manager.run();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !manager.is_quitting() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(manager.is_quitting(), "a FactoryMissing error must raise quit via the drain-control thread");
    manager.stop_and_join();
}

/// Emits `count` timeslices on a fixed run, for the Unfold/Fold pipeline
/// test below.
struct TimesliceSource {
    count: u64,
    emitted: u64,
}

impl jana_contracts::EventSource for TimesliceSource {
    type Item = u64;

    fn level(&self) -> EventLevel {
        EventLevel::Timeslice
    }

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

/// Splits each parent timeslice into a fixed number of children, counting
/// every child it emits on a shared atomic.
struct FixedUnfolder {
    children_per_parent: u32,
    emitted_for_current: u32,
    total_emitted: Arc<AtomicU64>,
}

impl Unfolder for FixedUnfolder {
    type Parent = u64;
    type Child = u64;

    fn unfold(
        &mut self,
        parent: &u64,
        _parent_ctx: &EventView,
        child_slot: &mut u64,
        child_number: EventNumber,
    ) -> Result<UnfoldStatus, FactoryError> {
        if self.emitted_for_current >= self.children_per_parent {
            self.emitted_for_current = 0;
            return Ok(UnfoldStatus::Finished);
        }
        *child_slot = *parent;
        self.emitted_for_current += 1;
        self.total_emitted.fetch_add(1, Ordering::AcqRel);
        let _ = child_number;
        Ok(UnfoldStatus::KeepGoing)
    }
}

/// Counts every child folded back onto its parent. Always reports
/// `KeepGoing`: parent completion is driven by `FoldArrow`'s own
/// lineage-pending-count tracking, not by this folder counting its own
/// children.
struct CountingFolder {
    total_folded: Arc<AtomicU64>,
}

impl Folder for CountingFolder {
    type Parent = u64;
    type Child = u64;

    fn fold(
        &mut self,
        _parent: &mut u64,
        _child: &u64,
        _child_ctx: &EventView,
    ) -> Result<FoldStatus, FactoryError> {
        self.total_folded.fetch_add(1, Ordering::AcqRel);
        Ok(FoldStatus::KeepGoing)
    }
}

struct CountingSinkProcessor {
    total_sunk: Arc<AtomicU64>,
}

impl Processor for CountingSinkProcessor {
    fn process(&mut self, _event: &EventView) -> Result<(), FactoryError> {
        self.total_sunk.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// §4.5's mandatory Unfold/Fold pipeline: every timeslice the source
/// emits must make it through Unfold, Map, Fold, and reach the Sink
/// exactly once, with exactly `children_per_parent` children folded per
/// parent. This is also the regression test for the lineage-attachment
/// bug that used to panic `FoldArrow::execute` on every timesliced run
/// (the parent event never carried the `Lineage` its children referenced).
#[test]
fn timesliced_pipeline_unfolds_and_folds_every_parent() {
    const TIMESLICE_COUNT: u64 = 12;
    const CHILDREN_PER_PARENT: u32 = 3;

    let total_emitted = Arc::new(AtomicU64::new(0));
    let total_folded = Arc::new(AtomicU64::new(0));
    let total_sunk = Arc::new(AtomicU64::new(0));

    let params = Arc::new(ParameterManager::new());
    let topology = TopologyBuilder::new(params, 1, 2)
        .add_timesliced_pipeline(
            "timesliced",
            TimesliceSource { count: TIMESLICE_COUNT, emitted: 0 },
            FixedUnfolder {
                children_per_parent: CHILDREN_PER_PARENT,
                emitted_for_current: 0,
                total_emitted: total_emitted.clone(),
            },
            CountingFolder { total_folded: total_folded.clone() },
            FactoryCatalog::new(),
            vec![],
            vec![Box::new(CountingSinkProcessor { total_sunk: total_sunk.clone() })],
        )
        .build();

    let manager = ThreadManager::new(&topology, 2, AffinityPolicy::None, Duration::from_micros(100));
    run_to_completion(&manager, Duration::from_secs(30));

    assert_eq!(
        total_emitted.load(Ordering::Acquire),
        TIMESLICE_COUNT * CHILDREN_PER_PARENT as u64
    );
    assert_eq!(total_folded.load(Ordering::Acquire), total_emitted.load(Ordering::Acquire));
    assert_eq!(total_sunk.load(Ordering::Acquire), TIMESLICE_COUNT);
}
