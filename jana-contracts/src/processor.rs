use crate::error::FactoryError;
use crate::event::EventView;

/// Terminal stage of a topology: consumes an event's data products for
/// side effects (histogram fills, file writes, counters) and produces no
/// output of its own.
///
/// Processors run at the Sink arrow and are never placed behind a
/// mailbox downstream of themselves; the engine calls `process` once per
/// event that reaches the sink, in event order if the processor declares
/// itself order-sensitive via [`Processor::sequential`].
pub trait Processor: Send {
    fn init(&mut self) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Whether the engine must serialize calls to `process` across
    /// worker threads (e.g. because this processor writes events to a
    /// file in order). Defaults to `false`: most processors only
    /// aggregate commutative statistics.
    fn sequential(&self) -> bool {
        false
    }

    fn process(&mut self, event: &EventView) -> Result<(), FactoryError>;

    fn finish(&mut self) -> Result<(), FactoryError> {
        Ok(())
    }
}
