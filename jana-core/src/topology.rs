use std::sync::Arc;

use jana_contracts::{EventSource, Folder, Processor, Unfolder};

use crate::arrow::{Arrow, FoldArrow, MapArrow, SinkArrow, SourceArrow, Trigger, UnfoldArrow};
use crate::event::Event;
use crate::factory_set::{self, FactoryHandle, FactorySet};
use crate::mailbox::Mailbox;
use crate::parameters::ParameterManager;
use crate::pool::Pool;

/// The catalogue of factory generators available to every event on one
/// pipeline, analogous to the original's `JFactoryGenerator` registry
/// (spec.md §4.11). Each registered generator produces one fresh,
/// independent [`jana_contracts::Factory`] instance per [`FactorySet`]
/// instantiation, matching `factory_set.rs`'s "a `FactorySet` belongs
/// exclusively to one event pool slot" model.
#[derive(Default)]
pub struct FactoryCatalog {
    generators: Vec<Box<dyn Fn() -> FactoryHandle + Send + Sync>>,
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory generator. `make` is called once per
    /// `FactorySet` the owning pool allocates (i.e. up to `EVENT_POOL_SIZE`
    /// times total, not once per event).
    pub fn register<F, Gen>(mut self, make: Gen) -> Self
    where
        F: jana_contracts::Factory + 'static,
        Gen: Fn() -> F + Send + Sync + 'static,
    {
        self.generators.push(Box::new(move || factory_set::wrap(make())));
        self
    }

    fn instantiate(&self) -> FactorySet {
        FactorySet::new(self.generators.iter().map(|make| make()).collect())
    }
}

/// The immutable-after-start DAG of arrows, mailboxes, and pools (spec.md
/// §3's "Topology"). Built by [`TopologyBuilder`] and handed to
/// [`crate::scheduler::Scheduler`]/[`crate::thread_manager::ThreadManager`].
pub struct Topology {
    arrows: Vec<Arc<dyn Arrow>>,
    depends_on: Vec<Vec<usize>>,
}

impl Topology {
    pub fn arrows(&self) -> &[Arc<dyn Arrow>] {
        &self.arrows
    }

    pub fn depends_on_table(&self) -> &[Vec<usize>] {
        &self.depends_on
    }

    pub fn arrow_count(&self) -> usize {
        self.arrows.len()
    }
}

/// Assembles arrows, mailboxes, and pools from registered sources,
/// factory catalogues, processors, and (optionally) unfolder/folder
/// pairs, deriving the Source → \[Unfold\] → Map → \[Fold\] → Sink arrow
/// graph the way `JApplication::Initialize` derives it from registered
/// generators rather than requiring hand-wired mailboxes (spec.md §4.11).
///
/// Two topology shapes are supported, matching the two concrete shapes
/// `examples/original_source` actually exercises: a flat pipeline with no
/// timeslicing (`add_pipeline`), and a timesliced one with an
/// Unfold/Fold pair bracketing the Map stage (`add_timesliced_pipeline`).
/// A single `Topology` may combine several such pipelines, each
/// contributing its own arrows to the shared scheduler.
pub struct TopologyBuilder {
    params: Arc<ParameterManager>,
    location_count: usize,
    worker_count: usize,
    arrows: Vec<Arc<dyn Arrow>>,
    depends_on: Vec<Vec<usize>>,
}

impl TopologyBuilder {
    pub fn new(params: Arc<ParameterManager>, location_count: usize, worker_count: usize) -> Self {
        Self {
            params,
            location_count: location_count.max(1),
            worker_count: worker_count.max(1),
            arrows: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    fn mailbox_capacity(&self) -> usize {
        self.params
            .register("MAILBOX_CAPACITY", (4 * self.worker_count) as i64)
            .unwrap_or((4 * self.worker_count) as i64)
            .max(1) as usize
    }

    fn mailbox_threshold(&self, capacity: usize) -> usize {
        (capacity / 4).max(1)
    }

    fn event_pool_size(&self) -> usize {
        self.params
            .register("EVENT_POOL_SIZE", (4 * self.worker_count) as i64)
            .unwrap_or((4 * self.worker_count) as i64)
            .max(1) as usize
    }

    fn new_mailbox<T>(&self) -> Arc<Mailbox<T>> {
        let capacity = self.mailbox_capacity();
        Arc::new(Mailbox::new(capacity, self.location_count, self.mailbox_threshold(capacity)))
    }

    /// Push `arrow` and record that it depends on every arrow index in
    /// `deps` for drain propagation (spec.md §4.8).
    fn push_arrow(&mut self, arrow: Arc<dyn Arrow>, deps: Vec<usize>) -> usize {
        let index = self.arrows.len();
        self.arrows.push(arrow);
        self.depends_on.push(deps);
        index
    }

    /// Wire a flat `Source -> Map -> Sink` pipeline: no timeslicing, one
    /// event level flows straight through. `S::Item` must be `Default`
    /// so the event pool can allocate empty slots for the source to fill
    /// in place, mirroring `EventSource::next`'s "write into slot rather
    /// than allocate" contract.
    pub fn add_pipeline<S>(
        mut self,
        source_name: impl Into<String>,
        source: S,
        catalog: FactoryCatalog,
        triggers: Vec<Trigger<S::Item>>,
        processors: Vec<Box<dyn Processor>>,
    ) -> Self
    where
        S: EventSource + 'static,
        S::Item: Default + Send + Sync + 'static,
    {
        let event_pool = Arc::new(Pool::new(self.location_count, self.worker_count, || {
            Event::new(S::Item::default())
        }));
        let factory_pool = Arc::new(Pool::new(self.location_count, self.worker_count, move || {
            catalog.instantiate()
        }));
        event_pool.set_limits(self.event_pool_size(), usize::MAX);
        factory_pool.set_limits(self.event_pool_size(), usize::MAX);

        let source_to_map: Arc<Mailbox<Event<S::Item>>> = self.new_mailbox();
        let map_to_sink: Arc<Mailbox<Event<S::Item>>> = self.new_mailbox();

        let source_name = source_name.into();
        let source_arrow: Arc<dyn Arrow> = Arc::new(SourceArrow::new(
            format!("{source_name}:source"),
            source,
            event_pool.clone(),
            factory_pool.clone(),
            source_to_map.clone(),
        ));
        let source_index = self.push_arrow(source_arrow, vec![]);

        let map_arrow: Arc<dyn Arrow> = Arc::new(MapArrow::new(
            format!("{source_name}:map"),
            source_to_map,
            map_to_sink.clone(),
            event_pool.clone(),
            factory_pool.clone(),
            triggers,
        ));
        let map_index = self.push_arrow(map_arrow, vec![source_index]);

        let sink_arrow: Arc<dyn Arrow> = Arc::new(SinkArrow::new(
            format!("{source_name}:sink"),
            map_to_sink,
            event_pool,
            factory_pool,
            processors,
        ));
        self.push_arrow(sink_arrow, vec![map_index]);

        self
    }

    /// Wire a timesliced `Source -> Unfold -> Map -> Fold -> Sink`
    /// pipeline: the source emits parent timeslices, `Unfolder` splits
    /// each into child physics events that flow through Map, `Folder`
    /// reassembles them onto the parent, and the Sink's processors see
    /// the folded parent (spec.md §3, §4.11). Both `P` (parent/timeslice)
    /// and `C` (child/physics-event) payloads must be `Default` for the
    /// same reason as `add_pipeline`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_timesliced_pipeline<S, U, F>(
        mut self,
        source_name: impl Into<String>,
        source: S,
        unfolder: U,
        folder: F,
        catalog: FactoryCatalog,
        triggers: Vec<Trigger<U::Child>>,
        processors: Vec<Box<dyn Processor>>,
    ) -> Self
    where
        S: EventSource<Item = U::Parent> + 'static,
        U: Unfolder + 'static,
        F: Folder<Parent = U::Parent, Child = U::Child> + 'static,
        U::Parent: Default + Send + Sync + 'static,
        U::Child: Default + Send + Sync + 'static,
    {
        let parent_pool = Arc::new(Pool::new(self.location_count, self.worker_count, || {
            Event::new(U::Parent::default())
        }));
        let child_pool = Arc::new(Pool::new(self.location_count, self.worker_count, || {
            Event::new(U::Child::default())
        }));
        let factory_pool = Arc::new(Pool::new(self.location_count, self.worker_count, move || {
            catalog.instantiate()
        }));
        let pool_size = self.event_pool_size();
        parent_pool.set_limits(pool_size, usize::MAX);
        child_pool.set_limits(pool_size, usize::MAX);
        factory_pool.set_limits(pool_size, usize::MAX);

        let source_to_unfold: Arc<Mailbox<Event<U::Parent>>> = self.new_mailbox();
        let unfold_to_map: Arc<Mailbox<Event<U::Child>>> = self.new_mailbox();
        let unfold_to_fold: Arc<Mailbox<Event<U::Parent>>> = self.new_mailbox();
        let map_to_fold: Arc<Mailbox<Event<U::Child>>> = self.new_mailbox();
        let fold_to_sink: Arc<Mailbox<Event<U::Parent>>> = self.new_mailbox();

        let source_name = source_name.into();
        let source_arrow: Arc<dyn Arrow> = Arc::new(SourceArrow::new(
            format!("{source_name}:source"),
            source,
            parent_pool.clone(),
            factory_pool.clone(),
            source_to_unfold.clone(),
        ));
        let source_index = self.push_arrow(source_arrow, vec![]);

        let unfold_arrow: Arc<dyn Arrow> = Arc::new(UnfoldArrow::new(
            format!("{source_name}:unfold"),
            source_to_unfold,
            unfold_to_map,
            unfold_to_fold.clone(),
            child_pool.clone(),
            factory_pool.clone(),
            unfolder,
        ));
        let unfold_index = self.push_arrow(unfold_arrow, vec![source_index]);

        let map_arrow: Arc<dyn Arrow> = Arc::new(MapArrow::new(
            format!("{source_name}:map"),
            unfold_to_map,
            map_to_fold.clone(),
            child_pool.clone(),
            factory_pool.clone(),
            triggers,
        ));
        let map_index = self.push_arrow(map_arrow, vec![unfold_index]);

        let fold_arrow: Arc<dyn Arrow> = Arc::new(FoldArrow::new(
            format!("{source_name}:fold"),
            unfold_to_fold,
            map_to_fold,
            fold_to_sink.clone(),
            child_pool,
            factory_pool.clone(),
            folder,
        ));
        let fold_index = self.push_arrow(fold_arrow, vec![unfold_index, map_index]);

        let sink_arrow: Arc<dyn Arrow> = Arc::new(SinkArrow::new(
            format!("{source_name}:sink"),
            fold_to_sink,
            parent_pool,
            factory_pool,
            processors,
        ));
        self.push_arrow(sink_arrow, vec![fold_index]);

        self
    }

    pub fn build(self) -> Topology {
        Topology {
            arrows: self.arrows,
            depends_on: self.depends_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jana_contracts::{EventNumber, FactoryError, RunNumber, SourceStatus};

    #[derive(Default)]
    struct CountingSource {
        remaining: u32,
        next_number: u64,
    }

    impl EventSource for CountingSource {
        type Item = u32;

        fn next(
            &mut self,
            slot: &mut u32,
        ) -> Result<(SourceStatus, EventNumber, RunNumber), String> {
            if self.remaining == 0 {
                return Ok((SourceStatus::Finished, EventNumber(0), RunNumber(0)));
            }
            self.remaining -= 1;
            *slot = self.remaining;
            let number = self.next_number;
            self.next_number += 1;
            Ok((SourceStatus::Success, EventNumber(number), RunNumber(1)))
        }
    }

    struct NoopProcessor;
    impl Processor for NoopProcessor {
        fn process(&mut self, _event: &jana_contracts::EventView) -> Result<(), FactoryError> {
            Ok(())
        }
    }

    #[test]
    fn flat_pipeline_has_three_arrows_with_linear_dependency_chain() {
        let params = Arc::new(ParameterManager::new());
        let topology = TopologyBuilder::new(params, 1, 2)
            .add_pipeline(
                "test",
                CountingSource { remaining: 10, next_number: 0 },
                FactoryCatalog::new(),
                vec![],
                vec![Box::new(NoopProcessor)],
            )
            .build();

        assert_eq!(topology.arrow_count(), 3);
        assert_eq!(
            topology.depends_on_table().to_vec(),
            vec![vec![], vec![0usize], vec![1usize]]
        );
    }
}
