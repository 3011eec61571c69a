use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use jana_contracts::LocationId;

use crate::arrow::Arrow;
use crate::metrics::ArrowStatus;

/// What a worker should do next: run a specific arrow, or sleep because
/// nothing is runnable right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    Arrow(usize),
    Idle,
}

struct ArrowSlot {
    arrow: Arc<dyn Arrow>,
    /// 0 for idle, 1 for a sequential arrow currently executing, or the
    /// count of concurrent workers inside a parallel arrow's `execute`.
    active: AtomicUsize,
    backoff_until: Mutex<Option<Instant>>,
}

/// Round-robin arrow scheduler, per spec.md §4.8: "a simple implementation
/// uses a round-robin scan over arrows under a shared mutex; more advanced
/// implementations may keep per-worker ready queues." The scan itself is
/// lock-free (an atomic cursor plus per-arrow atomics); only the rare
/// backoff-timestamp update takes a per-arrow mutex.
///
/// Location preference is approximated rather than tracked exactly: a
/// worker's home location biases where its scan starts, which tends to
/// land it on arrows whose mailboxes it last touched (and hence whose
/// cache lines are warm), without the scheduler needing to introspect
/// individual mailbox occupancy per location.
pub struct Scheduler {
    arrows: Vec<ArrowSlot>,
    cursor: AtomicUsize,
    backoff: Duration,
}

impl Scheduler {
    pub fn new(arrows: Vec<Arc<dyn Arrow>>, backoff: Duration) -> Self {
        let arrows = arrows
            .into_iter()
            .map(|arrow| ArrowSlot {
                arrow,
                active: AtomicUsize::new(0),
                backoff_until: Mutex::new(None),
            })
            .collect();
        Self {
            arrows,
            cursor: AtomicUsize::new(0),
            backoff,
        }
    }

    pub fn arrow_count(&self) -> usize {
        self.arrows.len()
    }

    pub fn arrow(&self, index: usize) -> &Arc<dyn Arrow> {
        &self.arrows[index].arrow
    }

    pub fn all_finished(&self) -> bool {
        self.arrows.iter().all(|slot| slot.arrow.is_finished())
    }

    /// Select the next arrow for `home_location` to run, or `Idle` if
    /// nothing is currently runnable. `last` reports the outcome of the
    /// assignment this worker ran previously, so a `ComeBackLater` can be
    /// given a short backoff before being reconsidered.
    pub fn next_assignment(
        &self,
        home_location: LocationId,
        last: Option<(usize, ArrowStatus)>,
    ) -> Assignment {
        let now = Instant::now();
        if let Some((index, ArrowStatus::ComeBackLater)) = last {
            *self.arrows[index].backoff_until.lock() = Some(now + self.backoff);
        }

        let n = self.arrows.len();
        if n == 0 {
            return Assignment::Idle;
        }
        let start = (home_location.0 + self.cursor.fetch_add(1, Ordering::Relaxed)) % n;

        for offset in 0..n {
            let index = (start + offset) % n;
            let slot = &self.arrows[index];
            if slot.arrow.is_finished() {
                continue;
            }
            if let Some(until) = *slot.backoff_until.lock() {
                if now < until {
                    continue;
                }
            }
            if slot.arrow.is_parallel() {
                slot.active.fetch_add(1, Ordering::AcqRel);
                return Assignment::Arrow(index);
            }
            if slot
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Assignment::Arrow(index);
            }
        }
        Assignment::Idle
    }

    /// Release the worker's claim on a sequential/parallel arrow slot once
    /// its `execute` call returns, whatever the outcome.
    pub fn release(&self, index: usize) {
        self.arrows[index].active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ArrowMetrics;
    use std::sync::atomic::AtomicBool;

    struct StubArrow {
        parallel: bool,
        finished: Arc<AtomicBool>,
        metrics: ArrowMetrics,
    }

    impl Arrow for StubArrow {
        fn name(&self) -> &str {
            "stub"
        }
        fn is_parallel(&self) -> bool {
            self.parallel
        }
        fn metrics(&self) -> &ArrowMetrics {
            &self.metrics
        }
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::Acquire)
        }
        fn execute(&self, _loc: LocationId) -> ArrowStatus {
            ArrowStatus::KeepGoing
        }
    }

    fn stub(parallel: bool) -> Arc<dyn Arrow> {
        Arc::new(StubArrow {
            parallel,
            finished: Arc::new(AtomicBool::new(false)),
            metrics: ArrowMetrics::new(),
        })
    }

    #[test]
    fn sequential_arrow_assigned_to_only_one_worker() {
        let scheduler = Scheduler::new(vec![stub(false)], Duration::from_millis(1));
        let first = scheduler.next_assignment(LocationId(0), None);
        assert_eq!(first, Assignment::Arrow(0));
        let second = scheduler.next_assignment(LocationId(1), None);
        assert_eq!(second, Assignment::Idle);
        scheduler.release(0);
        let third = scheduler.next_assignment(LocationId(1), None);
        assert_eq!(third, Assignment::Arrow(0));
    }

    #[test]
    fn parallel_arrow_assigned_to_many_workers() {
        let scheduler = Scheduler::new(vec![stub(true)], Duration::from_millis(1));
        assert_eq!(
            scheduler.next_assignment(LocationId(0), None),
            Assignment::Arrow(0)
        );
        assert_eq!(
            scheduler.next_assignment(LocationId(1), None),
            Assignment::Arrow(0)
        );
    }

    #[test]
    fn come_back_later_triggers_backoff() {
        let scheduler = Scheduler::new(vec![stub(true)], Duration::from_secs(60));
        scheduler.release(0);
        let assignment = scheduler.next_assignment(
            LocationId(0),
            Some((0, ArrowStatus::ComeBackLater)),
        );
        assert_eq!(assignment, Assignment::Idle);
    }

    #[test]
    fn finished_arrows_are_skipped() {
        let finished = Arc::new(AtomicBool::new(true));
        let arrow: Arc<dyn Arrow> = Arc::new(StubArrow {
            parallel: true,
            finished,
            metrics: ArrowMetrics::new(),
        });
        let scheduler = Scheduler::new(vec![arrow], Duration::from_millis(1));
        assert_eq!(
            scheduler.next_assignment(LocationId(0), None),
            Assignment::Idle
        );
    }
}
