use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use jana_contracts::LocationId;

/// Outcome of a [`Mailbox::pop`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopStatus {
    Ok,
    Empty,
}

/// Error returned by [`Mailbox::push`] when the mailbox is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("mailbox at capacity")]
pub struct QueueFull;

/// Bounded multi-producer/multi-consumer FIFO connecting two arrows.
///
/// Storage is partitioned into one sub-queue per [`LocationId`], each
/// behind its own mutex, so that producers and consumers pinned to the
/// same location never contend with another location's traffic. Capacity
/// accounting (`size` + outstanding `reserve`d slots ≤ capacity) is global
/// across all locations, as the spec requires `reserve`/`push` to stay
/// correct even when a result is produced on a different location than
/// the one it was popped from.
pub struct Mailbox<T> {
    sub_queues: Vec<Mutex<VecDeque<T>>>,
    capacity: usize,
    size: AtomicUsize,
    reserved: AtomicUsize,
    threshold: AtomicUsize,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize, location_count: usize, threshold: usize) -> Self {
        let location_count = location_count.max(1);
        let mut sub_queues = Vec::with_capacity(location_count);
        for _ in 0..location_count {
            sub_queues.push(Mutex::new(VecDeque::new()));
        }
        Self {
            sub_queues,
            capacity,
            size: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            threshold: AtomicUsize::new(threshold),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn get_threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }

    fn location_index(&self, loc: LocationId) -> usize {
        loc.0 % self.sub_queues.len()
    }

    /// Atomically records `n` future slots against capacity. Returns `n`
    /// if granted, `0` if fewer than `n` slots are currently free. Every
    /// successful reservation must be matched by a later `push`.
    pub fn reserve(&self, n: usize, _loc: LocationId) -> usize {
        if n == 0 {
            return 0;
        }
        loop {
            let size = self.size.load(Ordering::Acquire);
            let reserved = self.reserved.load(Ordering::Acquire);
            if self.capacity.saturating_sub(size + reserved) < n {
                return 0;
            }
            if self
                .reserved
                .compare_exchange(
                    reserved,
                    reserved + n,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return n;
            }
        }
    }

    /// Release `n` previously granted reservations without a matching
    /// push, for the protocol's "acquire input missed, release any
    /// reserved output" step.
    pub fn cancel_reservation(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(n))
            });
    }

    /// Append `item` to the sub-queue for `loc`. Fails with [`QueueFull`]
    /// only when the mailbox is genuinely full; a prior `reserve` makes
    /// this unreachable on the success path of the execute protocol.
    pub fn push(&self, item: T, loc: LocationId) -> Result<(), QueueFull> {
        let idx = self.location_index(loc);
        let mut queue = self.sub_queues[idx].lock();
        if self.size.load(Ordering::Acquire) >= self.capacity {
            return Err(QueueFull);
        }
        queue.push_back(item);
        self.size.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(1))
            });
        Ok(())
    }

    /// Push `item` back to the front of `loc`'s sub-queue, for the
    /// failure path of the execute protocol (step 5: return to origin).
    pub fn push_front(&self, item: T, loc: LocationId) {
        let idx = self.location_index(loc);
        let mut queue = self.sub_queues[idx].lock();
        queue.push_front(item);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove the head item, preferring `loc`'s own sub-queue and falling
    /// back to a round-robin scan of the others.
    pub fn pop(&self, loc: LocationId) -> (Option<T>, PopStatus) {
        let n = self.sub_queues.len();
        let start = self.location_index(loc);
        for offset in 0..n {
            let idx = (start + offset) % n;
            let mut queue = self.sub_queues[idx].lock();
            if let Some(item) = queue.pop_front() {
                self.size.fetch_sub(1, Ordering::AcqRel);
                return (Some(item), PopStatus::Ok);
            }
        }
        (None, PopStatus::Empty)
    }

    pub fn is_below_threshold(&self) -> bool {
        self.size() < self.get_threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(n: usize) -> LocationId {
        LocationId(n)
    }

    #[test]
    fn push_fails_when_full() {
        let mb: Mailbox<u32> = Mailbox::new(2, 1, 1);
        mb.push(1, loc(0)).unwrap();
        mb.push(2, loc(0)).unwrap();
        assert!(mb.push(3, loc(0)).is_err());
    }

    #[test]
    fn reserve_grants_up_to_free_capacity() {
        let mb: Mailbox<u32> = Mailbox::new(2, 1, 1);
        assert_eq!(mb.reserve(2, loc(0)), 2);
        assert_eq!(mb.reserve(1, loc(0)), 0);
        mb.push(1, loc(0)).unwrap();
        mb.push(2, loc(0)).unwrap();
        assert_eq!(mb.size(), 2);
    }

    #[test]
    fn fifo_within_one_location() {
        let mb: Mailbox<u32> = Mailbox::new(4, 1, 1);
        mb.push(1, loc(0)).unwrap();
        mb.push(2, loc(0)).unwrap();
        assert_eq!(mb.pop(loc(0)).0, Some(1));
        assert_eq!(mb.pop(loc(0)).0, Some(2));
        assert_eq!(mb.pop(loc(0)), (None, PopStatus::Empty));
    }

    #[test]
    fn pop_falls_back_across_locations() {
        let mb: Mailbox<u32> = Mailbox::new(4, 2, 1);
        mb.push(42, loc(1)).unwrap();
        assert_eq!(mb.pop(loc(0)).0, Some(42));
    }

    #[test]
    fn cancelled_reservation_frees_capacity_again() {
        let mb: Mailbox<u32> = Mailbox::new(2, 1, 1);
        assert_eq!(mb.reserve(2, loc(0)), 2);
        mb.cancel_reservation(2);
        assert_eq!(mb.reserve(2, loc(0)), 2);
    }
}
