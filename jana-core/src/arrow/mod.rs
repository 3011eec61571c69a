//! The five built-in arrow kinds (Source, Unfold, Map, Fold, Sink) and
//! the `Arrow` trait the scheduler drives them through.

mod fold_arrow;
mod map_arrow;
mod sink_arrow;
mod source_arrow;
mod unfold_arrow;

pub use fold_arrow::FoldArrow;
pub use map_arrow::{MapArrow, Trigger};
pub use sink_arrow::SinkArrow;
pub use source_arrow::SourceArrow;
pub use unfold_arrow::UnfoldArrow;

use jana_contracts::LocationId;

use crate::error::EngineError;
use crate::metrics::{ArrowMetrics, ArrowStatus};

/// One stage in the processing topology. The scheduler hands idle
/// workers runnable arrows by reference; `execute` runs the reserve →
/// acquire → process → publish protocol (spec.md §4.3) exactly once per
/// call and returns the resulting status.
pub trait Arrow: Send + Sync {
    fn name(&self) -> &str;

    /// Sequential arrows (sources, unfolders, folders) must never have
    /// more than one worker inside `execute` concurrently; the scheduler
    /// enforces this externally, this flag only advertises it.
    fn is_parallel(&self) -> bool;

    fn metrics(&self) -> &ArrowMetrics;

    fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// True once this arrow has permanently run out of work (e.g. its
    /// source is exhausted and its input mailbox is empty), meaning the
    /// scheduler may finalize it once all upstream arrows agree.
    fn is_finished(&self) -> bool;

    /// Called by the scheduler once it has determined every upstream
    /// arrow is terminal and this arrow's input mailbox is empty, so it
    /// may transition to finished and stop being scheduled. Source
    /// arrows ignore this: their `is_finished` already derives from the
    /// user source's own status.
    fn mark_finished(&self) {}

    /// Non-`None` once this arrow has observed an error category that
    /// aborts the run (`FactoryCycle`, `FactoryMissing`, `Fatal`, ...).
    /// Polled by the thread manager's control loop, which raises `quit`
    /// once any arrow reports one; default `None` covers arrows that can
    /// never produce a fatal error (sources, sinks without user factories
    /// in their path).
    fn take_fatal_error(&self) -> Option<EngineError> {
        None
    }

    fn execute(&self, loc: LocationId) -> ArrowStatus;
}
