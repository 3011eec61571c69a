use crate::error::FactoryError;
use crate::event::EventView;
use crate::ids::EventNumber;

/// Outcome of one `Unfolder::unfold` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnfoldStatus {
    /// `child` was populated with the next physics event drawn from the
    /// parent timeslice; call again for more.
    KeepGoing,
    /// The parent timeslice has no more child events to emit.
    Finished,
}

/// Splits a timeslice-level event into the physics events it contains.
///
/// Sits between a timeslice [`EventSource`](crate::EventSource) and the
/// Map arrows that process individual physics events; the engine calls
/// `unfold` repeatedly against the same parent until it reports
/// [`UnfoldStatus::Finished`], tracking how many children are still
/// in flight so the parent can be released once they all complete (see
/// the corresponding [`Folder`](crate::Folder)).
pub trait Unfolder: Send {
    type Parent: Send + 'static;
    type Child: Send + 'static;

    fn unfold(
        &mut self,
        parent: &Self::Parent,
        parent_ctx: &EventView,
        child_slot: &mut Self::Child,
        child_number: EventNumber,
    ) -> Result<UnfoldStatus, FactoryError>;
}
