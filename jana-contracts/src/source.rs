use crate::event::EventLevel;
use crate::ids::{EventNumber, RunNumber};

/// Outcome of one `EventSource::next` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    /// An event was emitted.
    Success,
    /// No event is available yet, but the source is not finished (e.g. a
    /// network socket that may still produce more). The scheduler should
    /// back off and retry rather than treat this as exhaustion.
    ComeBackLater,
    /// The source is exhausted; it will never emit again.
    Finished,
}

/// Produces events (or timeslices) at the head of a topology.
///
/// Implementations own whatever I/O is needed to read the next record
/// (file handle, socket, generator state) and write the decoded payload
/// into `slot` rather than allocating a fresh one each call, so the
/// engine can recycle buffers through a [pool].
///
/// [pool]: https://docs.rs/jana-core (see `Pool`)
pub trait EventSource: Send {
    type Item: Send + 'static;

    fn level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    /// Open any underlying resource. Called once before the first `next`.
    fn open(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Produce the next event into `slot`, reporting its identity.
    fn next(
        &mut self,
        slot: &mut Self::Item,
    ) -> Result<(SourceStatus, EventNumber, RunNumber), String>;
}
