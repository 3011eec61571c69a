use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use jana_contracts::LocationId;

use crate::metrics::ArrowStatus;
use crate::scheduler::{Assignment, Scheduler};
use crate::topology::Topology;

/// CPU-affinity strategy for worker threads. A hint only: the engine
/// remains correct if the underlying platform refuses or ignores the
/// pinning request (spec.md §4.9).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffinityPolicy {
    #[default]
    None,
    /// Worker `i` is pinned to CPU `i`.
    Sequential,
    /// Workers are pinned to distinct physical cores before any two share
    /// one (hyperthread siblings are exhausted last).
    CoreFill,
}

/// Distinguishes the three points in the worker pool's shutdown sequence
/// an operator or the final report might care about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadManagerState {
    Unstarted,
    Running,
    /// Sources have drained and every mailbox is empty, but OS threads
    /// haven't necessarily exited their loop yet.
    Quiesced,
    /// Worker loops have observed quit/drain and returned.
    Stopped,
    /// OS threads have been `join`ed.
    Joined,
}

/// Owns the worker OS threads, their affinity policy, and their lifecycle.
/// Each worker loops `acquire arrow -> execute -> release arrow -> update
/// metrics`, observing a shared quit flag between calls (spec.md §4.9,
/// §5 "All user-visible suspension is cooperative at arrow boundaries").
pub struct ThreadManager {
    scheduler: Arc<Scheduler>,
    depends_on: Vec<Vec<usize>>,
    worker_count: usize,
    affinity: AffinityPolicy,
    idle_sleep: Duration,
    quit: Arc<AtomicBool>,
    state: Mutex<ThreadManagerState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    ticks: Arc<AtomicU64>,
}

fn affinity_for(policy: AffinityPolicy, worker_index: usize) -> Option<core_affinity::CoreId> {
    match policy {
        AffinityPolicy::None => None,
        AffinityPolicy::Sequential | AffinityPolicy::CoreFill => {
            let core_ids = core_affinity::get_core_ids()?;
            if core_ids.is_empty() {
                return None;
            }
            Some(core_ids[worker_index % core_ids.len()])
        }
    }
}

impl ThreadManager {
    pub fn new(
        topology: &Topology,
        worker_count: usize,
        affinity: AffinityPolicy,
        idle_sleep: Duration,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            topology.arrows().to_vec(),
            idle_sleep.max(Duration::from_micros(1)),
        ));
        Self {
            scheduler,
            depends_on: topology.depends_on_table().to_vec(),
            worker_count: worker_count.max(1),
            affinity,
            idle_sleep,
            quit: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ThreadManagerState::Unstarted),
            handles: Mutex::new(Vec::new()),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn state(&self) -> ThreadManagerState {
        *self.state.lock()
    }

    /// Total worker iterations across all threads (each arrow assignment
    /// attempt, whether or not it found runnable work), exposed for
    /// tests/diagnostics rather than the final report.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Request a graceful stop. Workers finish their current `execute`
    /// call and exit on their next loop iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Whether every source has drained and every arrow has drained its
    /// own input behind it — the condition for a clean `quit` versus a
    /// forced one.
    pub fn is_quiesced(&self) -> bool {
        self.scheduler.all_finished()
    }

    /// One pass of the drain-propagation rule from spec.md §4.8: mark an
    /// arrow finished once every arrow upstream of it is itself finished.
    /// Intended to be called from the control thread's ticker, not from
    /// worker threads.
    pub fn propagate_drain(&self) {
        for (index, deps) in self.depends_on.iter().enumerate() {
            if deps.iter().all(|&d| self.scheduler.arrow(d).is_finished()) {
                self.scheduler.arrow(index).mark_finished();
            }
        }
    }

    /// Spawn `worker_count` OS threads plus one drain-control thread, and
    /// run the engine until `quit` is observed or every arrow finishes on
    /// its own (a finite source with no external quit signal). The
    /// control thread is the only caller of `propagate_drain`/fatal-error
    /// polling; workers only ever touch the scheduler's hot `execute`
    /// path (spec.md §4.9, "All user-visible suspension is cooperative at
    /// arrow boundaries").
    pub fn run(&self) {
        for arrow in 0..self.scheduler.arrow_count() {
            if let Err(err) = self.scheduler.arrow(arrow).initialize() {
                tracing::error!(arrow = self.scheduler.arrow(arrow).name(), %err, "arrow initialize failed");
            }
        }

        *self.state.lock() = ThreadManagerState::Running;
        let mut handles = Vec::with_capacity(self.worker_count + 1);
        for worker_index in 0..self.worker_count {
            let scheduler = Arc::clone(&self.scheduler);
            let quit = Arc::clone(&self.quit);
            let ticks = Arc::clone(&self.ticks);
            let affinity = self.affinity;
            let idle_sleep = self.idle_sleep;
            let handle = thread::Builder::new()
                .name(format!("jana-worker-{worker_index}"))
                .spawn(move || {
                    if let Some(core) = affinity_for(affinity, worker_index) {
                        core_affinity::set_for_current(core);
                    }
                    worker_loop(worker_index, &scheduler, &quit, &ticks, idle_sleep);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        {
            let scheduler = Arc::clone(&self.scheduler);
            let depends_on = self.depends_on.clone();
            let quit = Arc::clone(&self.quit);
            let idle_sleep = self.idle_sleep;
            let handle = thread::Builder::new()
                .name("jana-drain-control".to_string())
                .spawn(move || drain_control_loop(&scheduler, &depends_on, &quit, idle_sleep))
                .expect("failed to spawn drain-control thread");
            handles.push(handle);
        }

        *self.handles.lock() = handles;
    }

    /// Block until `quit` is observed and every worker thread has returned.
    pub fn stop_and_join(&self) {
        self.quit();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        *self.state.lock() = ThreadManagerState::Stopped;

        for arrow in 0..self.scheduler.arrow_count() {
            if let Err(err) = self.scheduler.arrow(arrow).finalize() {
                tracing::error!(arrow = self.scheduler.arrow(arrow).name(), %err, "arrow finalize failed");
            }
        }
        *self.state.lock() = ThreadManagerState::Joined;
    }
}

/// Runs on its own thread for the lifetime of `run()`: periodically
/// propagates drain status to downstream arrows and raises `quit` the
/// moment any arrow reports a fatal error (spec.md §7, "a fatal error
/// aborts the run"). Exits once every arrow has finished or `quit` is
/// observed from elsewhere (an external shutdown request).
fn drain_control_loop(
    scheduler: &Scheduler,
    depends_on: &[Vec<usize>],
    quit: &AtomicBool,
    idle_sleep: Duration,
) {
    loop {
        if quit.load(Ordering::Acquire) {
            return;
        }
        for (index, deps) in depends_on.iter().enumerate() {
            if deps.iter().all(|&d| scheduler.arrow(d).is_finished()) {
                scheduler.arrow(index).mark_finished();
            }
        }
        for index in 0..scheduler.arrow_count() {
            if let Some(err) = scheduler.arrow(index).take_fatal_error() {
                tracing::error!(arrow = scheduler.arrow(index).name(), %err, "fatal error, aborting run");
                quit.store(true, Ordering::Release);
                return;
            }
        }
        if scheduler.all_finished() {
            return;
        }
        thread::sleep(idle_sleep);
    }
}

fn worker_loop(
    _worker_index: usize,
    scheduler: &Scheduler,
    quit: &AtomicBool,
    ticks: &AtomicU64,
    idle_sleep: Duration,
) {
    let home = LocationId(_worker_index);
    let mut last: Option<(usize, ArrowStatus)> = None;
    loop {
        if quit.load(Ordering::Acquire) {
            return;
        }
        ticks.fetch_add(1, Ordering::Relaxed);
        match scheduler.next_assignment(home, last) {
            Assignment::Arrow(index) => {
                let status = scheduler.arrow(index).execute(home);
                scheduler.release(index);
                last = Some((index, status));
            }
            Assignment::Idle => {
                if scheduler.all_finished() {
                    return;
                }
                last = None;
                thread::sleep(idle_sleep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::Arrow;
    use crate::metrics::ArrowMetrics;
    use std::sync::atomic::AtomicUsize;

    struct CountingArrow {
        remaining: AtomicUsize,
        metrics: ArrowMetrics,
    }

    impl Arrow for CountingArrow {
        fn name(&self) -> &str {
            "counter"
        }
        fn is_parallel(&self) -> bool {
            false
        }
        fn metrics(&self) -> &ArrowMetrics {
            &self.metrics
        }
        fn is_finished(&self) -> bool {
            self.remaining.load(Ordering::Acquire) == 0
        }
        fn execute(&self, _loc: LocationId) -> ArrowStatus {
            let prev = self.remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then(|| n - 1)
            });
            match prev {
                Ok(_) => ArrowStatus::KeepGoing,
                Err(_) => ArrowStatus::Finished,
            }
        }
    }

    #[test]
    fn worker_pool_drains_a_finite_arrow_without_external_quit() {
        let arrow: Arc<dyn Arrow> = Arc::new(CountingArrow {
            remaining: AtomicUsize::new(50),
            metrics: ArrowMetrics::new(),
        });
        let scheduler = Arc::new(Scheduler::new(vec![arrow.clone()], Duration::from_micros(100)));
        let quit = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        worker_loop(0, &scheduler, &quit, &ticks, Duration::from_micros(100));
        assert!(arrow.is_finished());
    }
}
