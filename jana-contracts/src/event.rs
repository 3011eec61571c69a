use std::any::{Any, TypeId};

use crate::error::FactoryError;
use crate::ids::{EventNumber, RunNumber};

/// The granularity an event represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventLevel {
    /// A single physics event.
    PhysicsEvent,
    /// A coarser unit containing many physics events, expected to be
    /// unfolded before it reaches a Map arrow.
    Timeslice,
}

/// The handful of fields a factory needs about the event it is processing,
/// without needing to know about mailboxes, pools, or the factory set's
/// internal storage.
#[derive(Clone, Copy, Debug)]
pub struct EventContext {
    pub event_number: EventNumber,
    pub run_number: RunNumber,
    pub level: EventLevel,
}

/// Object-safe handle a factory set exposes to build [`EventView`]s and to
/// resolve `(type, tag)` lookups, including the lazy init/change-run/process
/// protocol described by the engine's factory lifecycle.
///
/// `get_erased` is intentionally non-generic (hence object-safe): the type
/// parameter lives on [`EventView::get`], which downcasts the `&dyn Any`
/// this returns.
pub trait FactorySetAccess {
    fn get_erased(
        &self,
        type_id: TypeId,
        tag: &str,
        ctx: EventContext,
    ) -> Result<&dyn Any, FactoryError>;
}

/// Borrowed view of one event, handed to factory and processor callbacks.
///
/// Calling [`EventView::get`] drives the lazy factory protocol: at most one
/// `init`, a `change_run` exactly when the run number changed, and at most
/// one `process` per event, memoised for subsequent calls within the same
/// event (see `jana-core`'s factory set for the concrete bookkeeping).
pub struct EventView<'a> {
    ctx: EventContext,
    factories: &'a dyn FactorySetAccess,
}

impl<'a> EventView<'a> {
    pub fn new(ctx: EventContext, factories: &'a dyn FactorySetAccess) -> Self {
        Self { ctx, factories }
    }

    pub fn event_number(&self) -> EventNumber {
        self.ctx.event_number
    }

    pub fn run_number(&self) -> RunNumber {
        self.ctx.run_number
    }

    pub fn level(&self) -> EventLevel {
        self.ctx.level
    }

    /// Resolve the memoised results of the `(T, tag)` factory, running
    /// `init`/`change_run`/`process` as needed.
    pub fn get<T: 'static>(&self, tag: &str) -> Result<&'a [T], FactoryError> {
        let any = self.factories.get_erased(TypeId::of::<T>(), tag, self.ctx)?;
        any.downcast_ref::<Vec<T>>()
            .map(|v| v.as_slice())
            .ok_or_else(|| FactoryError::TypeMismatch {
                tag: tag.to_string(),
            })
    }

    /// Convenience for the common untagged case.
    pub fn get_untagged<T: 'static>(&self) -> Result<&'a [T], FactoryError> {
        self.get("")
    }
}
