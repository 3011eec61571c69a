use std::time::Duration;

use parking_lot::Mutex;

/// Outcome of one `Arrow::process` call, and by extension of one
/// `Arrow::execute` protocol run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrowStatus {
    /// The item was processed; the arrow should be scheduled again.
    KeepGoing,
    /// This arrow has nothing left to do, permanently.
    Finished,
    /// Processing failed; the item was returned to its origin.
    Error,
    /// No progress was possible this call (reservation failed, input
    /// empty, pool exhausted); the caller should retry after a backoff.
    ComeBackLater,
}

/// Accumulated counters for one arrow, published after every `execute`
/// call and consulted by the final report.
#[derive(Debug, Default)]
struct MetricsInner {
    calls: u64,
    keep_going: u64,
    finished: u64,
    errors: u64,
    come_back_later: u64,
    total_latency: Duration,
    total_overhead: Duration,
}

/// Thread-safe accumulator for one arrow's execution statistics.
///
/// Arrows may run on any worker thread, so updates go through a mutex;
/// this is not a hot-path concern (per spec, per-execute cost dominates
/// over a single uncontended lock acquisition).
#[derive(Debug, Default)]
pub struct ArrowMetrics {
    inner: Mutex<MetricsInner>,
}

impl ArrowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: ArrowStatus, latency: Duration, overhead: Duration) {
        let mut inner = self.inner.lock();
        inner.calls += 1;
        match status {
            ArrowStatus::KeepGoing => inner.keep_going += 1,
            ArrowStatus::Finished => inner.finished += 1,
            ArrowStatus::Error => inner.errors += 1,
            ArrowStatus::ComeBackLater => inner.come_back_later += 1,
        }
        inner.total_latency += latency;
        inner.total_overhead += overhead;
    }

    pub fn calls(&self) -> u64 {
        self.inner.lock().calls
    }

    pub fn successful_calls(&self) -> u64 {
        self.inner.lock().keep_going
    }

    pub fn come_back_later_calls(&self) -> u64 {
        self.inner.lock().come_back_later
    }

    pub fn error_calls(&self) -> u64 {
        self.inner.lock().errors
    }

    pub fn total_latency(&self) -> Duration {
        self.inner.lock().total_latency
    }

    pub fn total_overhead(&self) -> Duration {
        self.inner.lock().total_overhead
    }

    /// Mean wall time spent inside `process`, per call; zero if unused.
    pub fn mean_latency(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.calls == 0 {
            Duration::ZERO
        } else {
            inner.total_latency / inner.calls as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_status_counts() {
        let metrics = ArrowMetrics::new();
        metrics.record(
            ArrowStatus::KeepGoing,
            Duration::from_millis(1),
            Duration::from_micros(10),
        );
        metrics.record(
            ArrowStatus::ComeBackLater,
            Duration::ZERO,
            Duration::from_micros(1),
        );
        assert_eq!(metrics.calls(), 2);
        assert_eq!(metrics.successful_calls(), 1);
        assert_eq!(metrics.come_back_later_calls(), 1);
    }

    #[test]
    fn mean_latency_is_zero_when_unused() {
        let metrics = ArrowMetrics::new();
        assert_eq!(metrics.mean_latency(), Duration::ZERO);
    }
}
