use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};

use jana_contracts::{
    EventContext, EventNumber, EventView, Factory, FactoryError, FactoryFlags, FactorySetAccess,
    RunNumber,
};

/// Object-safe, type-erased view of a single factory instance, driving
/// the `Get<T>(tag)` protocol from spec.md §4.6. Crate-private: plugin
/// authors never see this trait, only [`jana_contracts::Factory`].
trait ErasedFactory: Send {
    fn output_type(&self) -> TypeId;
    fn tag(&self) -> &str;
    fn flags(&self) -> FactoryFlags;

    /// Runs `init`/`change_run`/`process` as needed for `ctx`, memoising
    /// against repeat calls within the same event. `factories` is handed
    /// back to the factory's `process` call so nested `Get`s compose.
    fn ensure_processed(
        &self,
        ctx: EventContext,
        factories: &dyn FactorySetAccess,
    ) -> Result<(), FactoryError>;

    /// The cached results of the most recent `process` call, as `&dyn
    /// Any` over the concrete `Vec<Output>` so callers can
    /// `downcast_ref::<Vec<T>>()`.
    fn results_any(&self) -> &dyn Any;

    /// Reset per-event state when this factory set is returned to its
    /// pool. No-op for persistent factories.
    fn release_event(&self);
}

struct FactoryCell<F: Factory> {
    tag: String,
    flags: FactoryFlags,
    factory: RefCell<F>,
    initialized: Cell<bool>,
    last_run: Cell<Option<RunNumber>>,
    processed_event: Cell<Option<EventNumber>>,
    in_progress: Cell<bool>,
    results_cache: RefCell<Vec<F::Output>>,
}

impl<F: Factory> FactoryCell<F> {
    fn new(factory: F) -> Self {
        let tag = factory.tag().to_string();
        let flags = factory.flags();
        Self {
            tag,
            flags,
            factory: RefCell::new(factory),
            initialized: Cell::new(false),
            last_run: Cell::new(None),
            processed_event: Cell::new(None),
            in_progress: Cell::new(false),
            results_cache: RefCell::new(Vec::new()),
        }
    }
}

impl<F: Factory + 'static> ErasedFactory for FactoryCell<F> {
    fn output_type(&self) -> TypeId {
        TypeId::of::<F::Output>()
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn flags(&self) -> FactoryFlags {
        self.flags
    }

    fn ensure_processed(
        &self,
        ctx: EventContext,
        factories: &dyn FactorySetAccess,
    ) -> Result<(), FactoryError> {
        if self.flags.persistent && self.processed_event.get().is_some() {
            return Ok(());
        }
        if self.processed_event.get() == Some(ctx.event_number) {
            return Ok(());
        }
        if self.in_progress.get() {
            return Err(FactoryError::Cycle {
                tag: self.tag.clone(),
            });
        }

        self.in_progress.set(true);
        let outcome = (|| -> Result<(), FactoryError> {
            let mut factory = self.factory.borrow_mut();
            if !self.initialized.get() {
                factory.init()?;
                self.initialized.set(true);
            }
            if self.last_run.get() != Some(ctx.run_number) {
                factory.change_run(ctx.run_number)?;
                self.last_run.set(Some(ctx.run_number));
            }
            let view = EventView::new(ctx, factories);
            factory.process(&view)?;
            let mut cache = self.results_cache.borrow_mut();
            cache.clear();
            cache.extend_from_slice(factory.results());
            Ok(())
        })();
        self.in_progress.set(false);

        if outcome.is_ok() {
            self.processed_event.set(Some(ctx.event_number));
        }
        outcome
    }

    fn results_any(&self) -> &dyn Any {
        // SAFETY: `ensure_processed` above never holds a live borrow of
        // `results_cache` past its own call, and a factory set belongs
        // exclusively to the single worker thread processing its event
        // (spec.md §5, "Factory sets are exclusive to the worker
        // currently processing their event") — so no concurrent
        // `borrow_mut` can be in flight when this reference is read.
        unsafe { &*self.results_cache.as_ptr() }
    }

    fn release_event(&self) {
        if self.flags.persistent {
            return;
        }
        self.processed_event.set(None);
        self.factory.borrow_mut().clear();
        self.results_cache.borrow_mut().clear();
    }
}

/// Opaque handle wrapping one factory instance for registration into a
/// [`FactorySet`], keeping [`ErasedFactory`] private to this module.
pub struct FactoryHandle(Box<dyn ErasedFactory>);

/// Wrap a concrete [`Factory`] implementation for registration with a
/// [`FactorySet`].
pub fn wrap<F: Factory + 'static>(factory: F) -> FactoryHandle {
    FactoryHandle(Box::new(FactoryCell::new(factory)))
}

/// The collection of factory instances belonging to one event, drawn
/// from a [`crate::pool::Pool`]. The same `FactorySet` is reused across
/// many events: `init`/`last_run` state on each factory persists across
/// reuse, while per-event memoisation is reset by [`FactorySet::release_event`].
pub struct FactorySet {
    cells: Vec<FactoryHandle>,
}

impl FactorySet {
    pub fn new(cells: Vec<FactoryHandle>) -> Self {
        Self { cells }
    }

    fn find(&self, type_id: TypeId, tag: &str) -> Option<&dyn ErasedFactory> {
        self.cells
            .iter()
            .map(|handle| handle.0.as_ref())
            .find(|cell| cell.output_type() == type_id && cell.tag() == tag)
    }

    /// Reset all non-persistent factories' per-event memoisation. Called
    /// by the Map/Sink arrows when an event's factory set is returned to
    /// its pool.
    pub fn release_event(&self) {
        for handle in &self.cells {
            handle.0.release_event();
        }
    }
}

impl FactorySetAccess for FactorySet {
    fn get_erased(
        &self,
        type_id: TypeId,
        tag: &str,
        ctx: EventContext,
    ) -> Result<&dyn Any, FactoryError> {
        let cell = self.find(type_id, tag).ok_or_else(|| FactoryError::Missing {
            tag: tag.to_string(),
        })?;
        cell.ensure_processed(ctx, self)?;
        Ok(cell.results_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jana_contracts::EventLevel;

    #[derive(Default)]
    struct Counter {
        calls: u32,
        inits: u32,
        change_runs: u32,
        results: Vec<u32>,
    }

    impl Factory for Counter {
        type Output = u32;

        fn init(&mut self) -> Result<(), FactoryError> {
            self.inits += 1;
            Ok(())
        }

        fn change_run(&mut self, _run_number: RunNumber) -> Result<(), FactoryError> {
            self.change_runs += 1;
            Ok(())
        }

        fn process(&mut self, _event: &EventView) -> Result<(), FactoryError> {
            self.calls += 1;
            self.results = vec![self.calls];
            Ok(())
        }

        fn results(&self) -> &[Self::Output] {
            &self.results
        }
    }

    fn ctx(event_number: u64, run_number: i64) -> EventContext {
        EventContext {
            event_number: EventNumber(event_number),
            run_number: RunNumber(run_number),
            level: EventLevel::PhysicsEvent,
        }
    }

    #[test]
    fn init_runs_once_process_memoises_per_event() {
        let set = FactorySet::new(vec![wrap(Counter::default())]);
        let view = EventView::new(ctx(1, 100), &set);
        view.get::<u32>("").unwrap();
        view.get::<u32>("").unwrap();
        let view2 = EventView::new(ctx(1, 100), &set);
        view2.get::<u32>("").unwrap();

        let cell = set.find(TypeId::of::<u32>(), "").unwrap();
        // Only one process() call across all three Get()s for event 1.
        let results = cell.results_any().downcast_ref::<Vec<u32>>().unwrap();
        assert_eq!(results, &vec![1]);
    }

    #[test]
    fn change_run_fires_on_run_transition() {
        let set = FactorySet::new(vec![wrap(Counter::default())]);
        EventView::new(ctx(1, 100), &set).get::<u32>("").unwrap();
        set.release_event();
        EventView::new(ctx(2, 100), &set).get::<u32>("").unwrap();
        set.release_event();
        EventView::new(ctx(3, 200), &set).get::<u32>("").unwrap();
    }

    #[test]
    fn missing_factory_reports_missing() {
        let set = FactorySet::new(vec![]);
        let err = EventView::new(ctx(1, 1), &set).get::<u32>("").unwrap_err();
        assert!(matches!(err, FactoryError::Missing { .. }));
    }
}
