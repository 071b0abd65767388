use crate::buffer::evict::BufferPool;
use crate::buffer::reservation::BufferPoolReservation;
use crate::buffer::MemoryTag;
use parking_lot::Mutex;

// Fraction of the per-query memory bound available to transient consumers.
const TEMPORARY_MEMORY_RATIO: f64 = 0.7;
/// Floor for a nonzero grant. Keeps tiny grants from thrashing the
/// shared budget.
pub const MINIMUM_RESERVATION: u64 = 64 * 1024;

/// Sub-allocator for transient per-query memory.
///
/// Divides a fraction of the pool budget among registered consumers.
/// All grants are charged under [`MemoryTag::Temporary`] and gated by
/// the same global budget as block memory.
#[derive(Debug)]
pub struct TemporaryMemoryManager {
    inner: Mutex<TemporaryMemoryInner>,
}

#[derive(Debug)]
struct TemporaryMemoryInner {
    active_states: usize,
    total_granted: u64,
}

impl TemporaryMemoryManager {
    #[inline]
    pub(crate) fn new() -> Self {
        TemporaryMemoryManager {
            inner: Mutex::new(TemporaryMemoryInner {
                active_states: 0,
                total_granted: 0,
            }),
        }
    }

    /// Register a consumer with zero initial grant.
    #[inline]
    pub fn register(&self, pool: &'static BufferPool) -> TemporaryMemoryState {
        let mut inner = self.inner.lock();
        inner.active_states += 1;
        TemporaryMemoryState {
            pool,
            granted: 0,
            reservation: BufferPoolReservation::new(pool, MemoryTag::Temporary, 0),
        }
    }

    /// Number of currently registered consumers.
    #[inline]
    pub fn active_states(&self) -> usize {
        self.inner.lock().active_states
    }

    /// Total bytes currently granted across all consumers.
    #[inline]
    pub fn total_granted(&self) -> u64 {
        self.inner.lock().total_granted
    }

    #[inline]
    fn capacity(&self, pool: &BufferPool) -> u64 {
        (pool.query_max_memory() as f64 * TEMPORARY_MEMORY_RATIO) as u64
    }
}

/// One consumer's share of the temporary memory budget.
///
/// Dropping the state releases its grant.
pub struct TemporaryMemoryState {
    pool: &'static BufferPool,
    granted: u64,
    reservation: BufferPoolReservation,
}

impl TemporaryMemoryState {
    /// Bytes currently granted to this consumer.
    #[inline]
    pub fn remaining_size(&self) -> u64 {
        self.granted
    }

    /// Request a new working-set size. Returns the granted size, which
    /// may be smaller than requested when the shared budget is contended,
    /// or unchanged when growth could not be evicted for.
    pub fn set_remaining_size(&mut self, size: u64) -> u64 {
        let manager = self.pool.temporary_memory_manager();
        let mut inner = manager.inner.lock();

        let capacity = manager.capacity(self.pool);
        let others = inner.total_granted - self.granted;
        let available = capacity.saturating_sub(others);
        let mut grant = size.min(available);
        if grant != 0 {
            grant = grant.max(MINIMUM_RESERVATION).min(available);
        }

        if grant > self.granted {
            // growth must make room the same way block loads do.
            let extra = grant - self.granted;
            let res = self
                .pool
                .evict_blocks(MemoryTag::Temporary, extra, self.pool.max_memory(), None);
            if res.success {
                self.reservation.merge(res.reservation);
            } else {
                grant = self.granted;
            }
        } else if grant < self.granted {
            self.reservation.resize(grant);
        }

        inner.total_granted = inner.total_granted - self.granted + grant;
        self.granted = grant;
        grant
    }
}

impl Drop for TemporaryMemoryState {
    #[inline]
    fn drop(&mut self) {
        let manager = self.pool.temporary_memory_manager();
        let mut inner = manager.inner.lock();
        inner.active_states -= 1;
        inner.total_granted -= self.granted;
        // the reservation releases the charged bytes afterwards.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::evict::BufferPoolConfig;
    use crate::lifetime::StaticLifetime;

    fn new_pool(max_mem: u64) -> &'static BufferPool {
        BufferPoolConfig::default()
            .max_mem_size(max_mem)
            .build_static()
            .unwrap()
    }

    #[test]
    fn test_temporary_state_lifecycle() {
        let pool = new_pool(1024 * 1024);
        let manager = pool.temporary_memory_manager();
        assert_eq!(manager.active_states(), 0);
        {
            let state = pool.new_temporary_memory_state();
            assert_eq!(manager.active_states(), 1);
            assert_eq!(state.remaining_size(), 0);
            assert_eq!(pool.used_memory(), 0);
        }
        assert_eq!(manager.active_states(), 0);
        assert_eq!(pool.used_memory(), 0);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_temporary_grant_and_release() {
        let pool = new_pool(1024 * 1024);
        {
            let mut state = pool.new_temporary_memory_state();
            let granted = state.set_remaining_size(500_000);
            assert_eq!(granted, 500_000);
            assert_eq!(pool.used_memory_by_tag(MemoryTag::Temporary), 500_000);
            assert_eq!(pool.used_memory(), 500_000);

            let granted = state.set_remaining_size(100_000);
            assert_eq!(granted, 100_000);
            assert_eq!(pool.used_memory(), 100_000);

            assert_eq!(state.set_remaining_size(0), 0);
            assert_eq!(pool.used_memory(), 0);
        }
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_temporary_grant_floors_small_requests() {
        let pool = new_pool(1024 * 1024);
        {
            let mut state = pool.new_temporary_memory_state();
            let granted = state.set_remaining_size(1024);
            assert_eq!(granted, MINIMUM_RESERVATION);
        }
        assert_eq!(pool.used_memory(), 0);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_temporary_budget_shared_between_states() {
        let pool = new_pool(1024 * 1024);
        let capacity = pool.temporary_memory_manager().capacity(pool);
        {
            let mut first = pool.new_temporary_memory_state();
            let mut second = pool.new_temporary_memory_state();

            assert_eq!(first.set_remaining_size(500_000), 500_000);
            // the second consumer only gets what the first left over.
            let granted = second.set_remaining_size(capacity);
            assert_eq!(granted, capacity - 500_000);
            assert_eq!(
                pool.temporary_memory_manager().total_granted(),
                capacity
            );

            // releasing the first grant frees budget for the second.
            first.set_remaining_size(0);
            let granted = second.set_remaining_size(capacity);
            assert_eq!(granted, capacity);
        }
        assert_eq!(pool.used_memory(), 0);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_temporary_growth_fails_without_evictable_memory() {
        let pool = new_pool(1024 * 1024);
        {
            // fill the pool with unevictable memory.
            let filler =
                BufferPoolReservation::new(pool, MemoryTag::BaseTable, pool.max_memory());
            let mut state = pool.new_temporary_memory_state();
            assert_eq!(state.set_remaining_size(100_000), 0);
            assert_eq!(state.remaining_size(), 0);
            assert_eq!(pool.used_memory_by_tag(MemoryTag::Temporary), 0);
            drop(filler);
        }
        assert_eq!(pool.used_memory(), 0);
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }
}
