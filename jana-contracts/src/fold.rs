use crate::error::FactoryError;
use crate::event::EventView;

/// Outcome of one `Folder::fold` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FoldStatus {
    /// The parent timeslice still has children outstanding.
    KeepGoing,
    /// This was the last child; the parent is ready to advance to the
    /// Sink arrow.
    Finished,
}

/// Accumulates physics-event results back into the timeslice that
/// produced them, mirroring [`Unfolder`](crate::Unfolder) on the way out
/// of the Map stage.
pub trait Folder: Send {
    type Parent: Send + 'static;
    type Child: Send + 'static;

    fn fold(
        &mut self,
        parent: &mut Self::Parent,
        child: &Self::Child,
        child_ctx: &EventView,
    ) -> Result<FoldStatus, FactoryError>;
}
