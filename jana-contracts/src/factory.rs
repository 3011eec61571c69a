use crate::error::FactoryError;
use crate::event::EventView;
use crate::ids::RunNumber;

/// Flags controlling how the engine treats a factory instance across
/// events and run boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactoryFlags {
    /// Results survive into the next event instead of being cleared. The
    /// factory itself is responsible for deciding when to recompute; the
    /// engine will not call `process` again unless the factory clears its
    /// own results.
    pub persistent: bool,
    /// The factory set owns the produced objects outright (as opposed to
    /// e.g. holding borrowed/shared references), so the engine drops them
    /// on `clear` rather than leaving that to the factory's own `Drop`
    /// impl.
    pub object_owner: bool,
}

/// Computes a single `(type, tag)` data product from the products of other
/// factories, requested through the [`EventView`] handed to `process`.
///
/// The engine calls `init` at most once per factory instance, `change_run`
/// exactly when the run number changes relative to the last event the
/// factory saw, and `process` at most once per event (unless
/// [`FactoryFlags::persistent`] tells the engine to skip recomputation
/// entirely once results are present).
pub trait Factory: Send {
    /// `Clone` lets the engine cache a type-erased copy of the results
    /// for `EventView::get`'s downcast without the factory itself having
    /// to expose anything beyond a borrowed slice.
    type Output: Send + Clone + 'static;

    /// Tag distinguishing this factory from siblings producing the same
    /// `Output` type. Empty string is the untagged default.
    fn tag(&self) -> &str {
        ""
    }

    fn flags(&self) -> FactoryFlags {
        FactoryFlags::default()
    }

    /// Called once, before the first `process` call on this instance.
    fn init(&mut self) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Called whenever the run number differs from the one seen by the
    /// previous `process` call on this instance.
    fn change_run(&mut self, _run_number: RunNumber) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Compute this event's results, pulling dependencies via `event.get`.
    fn process(&mut self, event: &EventView) -> Result<(), FactoryError>;

    /// The results computed by the most recent `process` call.
    fn results(&self) -> &[Self::Output];

    /// Drop the current results so the next `process` call recomputes
    /// them. Not called by the engine when `persistent` is set.
    fn clear(&mut self) {}
}
