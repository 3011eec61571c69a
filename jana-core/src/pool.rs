use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use jana_contracts::LocationId;

/// Reusable-item allocator, partitioned by [`LocationId`] the same way as
/// [`crate::mailbox::Mailbox`].
///
/// Exhaustion is not an error: [`Pool::get`] returns `None` and the caller
/// (an arrow's `execute`) treats that as `ComeBackLater`. An item factory
/// closure supplies freshly-allocated items when the free list is empty
/// and the pool has not yet reached `max_size`.
pub struct Pool<T> {
    free_lists: Vec<Mutex<Vec<T>>>,
    allocated: AtomicUsize,
    max_size: AtomicUsize,
    max_inflight: AtomicUsize,
    inflight: AtomicUsize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    /// `worker_count` seeds the default `max_size` heuristic
    /// (`max_size ≥ 2 * worker_count`) so pools don't thrash allocating
    /// under initial load before `set_limits` is called explicitly.
    pub fn new(
        location_count: usize,
        worker_count: usize,
        make: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let location_count = location_count.max(1);
        let mut free_lists = Vec::with_capacity(location_count);
        for _ in 0..location_count {
            free_lists.push(Mutex::new(Vec::new()));
        }
        Self {
            free_lists,
            allocated: AtomicUsize::new(0),
            max_size: AtomicUsize::new((2 * worker_count.max(1)).max(1)),
            max_inflight: AtomicUsize::new(usize::MAX),
            inflight: AtomicUsize::new(0),
            make: Box::new(make),
        }
    }

    pub fn set_limits(&self, max_size: usize, max_inflight: usize) {
        self.max_size.store(max_size.max(1), Ordering::Release);
        self.max_inflight.store(max_inflight, Ordering::Release);
    }

    fn location_index(&self, loc: LocationId) -> usize {
        loc.0 % self.free_lists.len()
    }

    /// Recycle a free item, or allocate a fresh one if under
    /// `max_size`/`max_inflight`. Returns `None` on exhaustion.
    pub fn get(&self, loc: LocationId) -> Option<T> {
        let idx = self.location_index(loc);
        {
            let mut free = self.free_lists[idx].lock();
            if let Some(item) = free.pop() {
                self.inflight.fetch_add(1, Ordering::AcqRel);
                return Some(item);
            }
        }
        if self.inflight.load(Ordering::Acquire) >= self.max_inflight.load(Ordering::Acquire) {
            return None;
        }
        if self.allocated.load(Ordering::Acquire) >= self.max_size.load(Ordering::Acquire) {
            return None;
        }
        self.allocated.fetch_add(1, Ordering::AcqRel);
        self.inflight.fetch_add(1, Ordering::AcqRel);
        Some((self.make)())
    }

    /// Return `item` to its location's free list, or drop it (shrinking
    /// `allocated`) if the pool has grown past `max_size` since it was
    /// checked out.
    pub fn put(&self, item: T, loc: LocationId) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let idx = self.location_index(loc);
        let mut free = self.free_lists[idx].lock();
        if free.len() + 1 > self.max_size.load(Ordering::Acquire) {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
            drop(item);
        } else {
            free.push(item);
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(n: usize) -> LocationId {
        LocationId(n)
    }

    #[test]
    fn allocates_up_to_max_size_then_exhausts() {
        let pool: Pool<Vec<u8>> = Pool::new(1, 1, Vec::new);
        pool.set_limits(2, usize::MAX);
        let a = pool.get(loc(0));
        let b = pool.get(loc(0));
        let c = pool.get(loc(0));
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[test]
    fn put_recycles_for_later_get() {
        let pool: Pool<u32> = Pool::new(1, 1, || 0);
        pool.set_limits(1, usize::MAX);
        let item = pool.get(loc(0)).unwrap();
        pool.put(item, loc(0));
        assert!(pool.get(loc(0)).is_some());
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn default_max_size_follows_worker_count_heuristic() {
        let pool: Pool<u32> = Pool::new(1, 4, || 0);
        for _ in 0..8 {
            assert!(pool.get(loc(0)).is_some());
        }
        assert!(pool.get(loc(0)).is_none());
    }
}
