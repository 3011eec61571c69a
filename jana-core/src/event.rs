use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use jana_contracts::{EventContext, EventLevel, EventNumber, EventView, RunNumber};

use crate::factory_set::FactorySet;

/// Tracks how many child events still reference a parent timeslice.
///
/// The parent owns this counter; children hold only a non-owning
/// [`Arc`] clone, so there is no ownership cycle between parent and
/// children. The parent is releasable once the counter reaches zero.
#[derive(Debug, Default)]
pub struct Lineage {
    pending: AtomicUsize,
}

impl Lineage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_child(self: &Arc<Self>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Called when a child event completes. Returns `true` if this was
    /// the last outstanding child, i.e. the parent may now be released.
    pub fn release_child(self: &Arc<Self>) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// One unit of work flowing through the topology: a physics event or a
/// timeslice, plus the per-event factory set that memoises results
/// computed on demand.
///
/// `Event` is pool-allocated and reused across its lifetime in the
/// engine; [`Event::reset`] re-stamps identity fields and hands back a
/// fresh (or persistence-preserving) factory set when drawn from the
/// pool again.
pub struct Event<T> {
    event_number: EventNumber,
    run_number: RunNumber,
    level: EventLevel,
    source_name: Option<Arc<str>>,
    lineage: Option<Arc<Lineage>>,
    pub payload: T,
    factories: Option<FactorySet>,
}

impl<T> Event<T> {
    pub fn new(payload: T) -> Self {
        Self {
            event_number: EventNumber::default(),
            run_number: RunNumber::default(),
            level: EventLevel::PhysicsEvent,
            source_name: None,
            lineage: None,
            payload,
            factories: None,
        }
    }

    /// Re-stamp identity fields when this (pool-recycled) event is
    /// handed a new piece of work. Does not touch `factories`: the
    /// caller decides whether to attach a fresh factory set or reuse one
    /// already drawn from the factory-set pool.
    pub fn reset(
        &mut self,
        event_number: EventNumber,
        run_number: RunNumber,
        level: EventLevel,
        source_name: Arc<str>,
    ) {
        self.event_number = event_number;
        self.run_number = run_number;
        self.level = level;
        self.source_name = Some(source_name);
        self.lineage = None;
    }

    pub fn attach_factories(&mut self, factories: FactorySet) {
        self.factories = Some(factories);
    }

    pub fn take_factories(&mut self) -> Option<FactorySet> {
        self.factories.take()
    }

    pub fn attach_lineage(&mut self, lineage: Arc<Lineage>) {
        self.lineage = Some(lineage);
    }

    pub fn lineage(&self) -> Option<&Arc<Lineage>> {
        self.lineage.as_ref()
    }

    pub fn event_number(&self) -> EventNumber {
        self.event_number
    }

    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// The name of the source this event originated from. Accessing this
    /// before a source has stamped the event is a programming error: an
    /// event with no source attached cannot legally exist downstream of
    /// the Source arrow.
    pub fn get_event_source(&self) -> &str {
        self.source_name
            .as_deref()
            .expect("Fatal: event has no attached source")
    }

    fn context(&self) -> EventContext {
        EventContext {
            event_number: self.event_number,
            run_number: self.run_number,
            level: self.level,
        }
    }

    /// Borrow a [`EventView`] over this event's factory set. Panics (per
    /// `JEvent::Get`'s `Fatal`/`throw` behaviour in the original) if no
    /// factory set has been attached yet.
    pub fn view(&self) -> EventView<'_> {
        let factories = self
            .factories
            .as_ref()
            .expect("Fatal: event has no attached factory set");
        EventView::new(self.context(), factories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_releases_only_on_last_child() {
        let lineage = Lineage::new();
        lineage.add_child();
        lineage.add_child();
        assert!(!lineage.release_child());
        assert!(lineage.release_child());
    }

    #[test]
    #[should_panic(expected = "no attached source")]
    fn get_event_source_panics_without_source() {
        let event = Event::new(());
        event.get_event_source();
    }
}
