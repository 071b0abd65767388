use crate::buffer::evict::BufferPool;
use crate::buffer::reservation::BufferPoolReservation;
use crate::buffer::MemoryTag;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

pub type BlockId = u64;

/// Owning byte region of one resident block.
///
/// Stands in for concrete block storage: the pool only needs the region
/// to be releasable and its size to be observable.
pub struct BlockBuffer {
    data: Box<[u8]>,
}

impl BlockBuffer {
    /// Allocate a zeroed buffer of given byte size.
    #[inline]
    pub fn allocate(size: usize) -> Self {
        BlockBuffer {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Byte size of the allocated region.
    #[inline]
    pub fn alloc_size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// The block's memory is released. The handle may be reloaded later.
    Unloaded = 0,
    /// The block is resident in memory.
    Loaded = 1,
}

impl From<u8> for BlockState {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => BlockState::Unloaded,
            1 => BlockState::Loaded,
            _ => unreachable!("invalid block state"),
        }
    }
}

struct BlockInner {
    buffer: Option<BlockBuffer>,
    // Charge of the resident buffer against the pool.
    // Zero-sized whenever the block is unloaded.
    memory_charge: BufferPoolReservation,
}

/// Owner of a resident block's memory and pin count.
///
/// The handle lock protects the unload decision and the transition to
/// unloaded. `state` and `readers` are additionally readable without the
/// lock as an approximate pre-check; any decision based on them must be
/// re-verified under the lock.
pub struct BlockHandle {
    pool: &'static BufferPool,
    block_id: BlockId,
    tag: MemoryTag,
    state: AtomicU8,
    // Number of active pins. Mutated under the handle lock.
    readers: AtomicU64,
    // Incremented on every enqueue of this handle. Identifies the latest
    // queue entry; never decremented or reset.
    eviction_timestamp: AtomicU64,
    inner: Mutex<BlockInner>,
}

impl BlockHandle {
    /// Create a new unloaded handle.
    #[inline]
    pub fn new(pool: &'static BufferPool, block_id: BlockId, tag: MemoryTag) -> Arc<Self> {
        Arc::new(BlockHandle {
            pool,
            block_id,
            tag,
            state: AtomicU8::new(BlockState::Unloaded as u8),
            readers: AtomicU64::new(0),
            eviction_timestamp: AtomicU64::new(0),
            inner: Mutex::new(BlockInner {
                buffer: None,
                memory_charge: BufferPoolReservation::new(pool, tag, 0),
            }),
        })
    }

    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[inline]
    pub fn tag(&self) -> MemoryTag {
        self.tag
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        BlockState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.state() == BlockState::Loaded
    }

    #[inline]
    pub fn readers(&self) -> u64 {
        self.readers.load(Ordering::Acquire)
    }

    /// Whether the handle is currently eligible for eviction.
    ///
    /// Approximate without the handle lock. The eviction path re-checks
    /// under the lock before unloading.
    #[inline]
    pub fn can_unload(&self) -> bool {
        self.readers.load(Ordering::Acquire) == 0 && self.is_loaded()
    }

    #[inline]
    pub fn eviction_timestamp(&self) -> u64 {
        self.eviction_timestamp.load(Ordering::Acquire)
    }

    /// Bump the enqueue timestamp, tombstoning all prior queue entries.
    ///
    /// Only called with the handle lock held or while the handle is not
    /// yet shared.
    #[inline]
    pub(crate) fn bump_eviction_timestamp(self: &Arc<Self>) -> u64 {
        debug_assert!(self.inner.is_locked() || Arc::strong_count(self) == 1);
        self.eviction_timestamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Acquire the handle lock.
    #[inline]
    pub fn lock(&self) -> BlockLock<'_> {
        BlockLock {
            handle: self,
            inner: self.inner.lock(),
        }
    }

    /// Pin the block, preventing eviction. Returns false if the block is
    /// not resident; the caller must load it first.
    #[inline]
    pub fn pin(&self) -> bool {
        let g = self.inner.lock();
        if !self.is_loaded() {
            return false;
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        drop(g);
        true
    }

    /// Unpin the block. When the last pin is released, the handle
    /// re-enters the eviction queue and may trigger a queue purge.
    #[inline]
    pub fn unpin(self: &Arc<Self>) {
        let g = self.inner.lock();
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        let mut purge = false;
        if prev == 1 && self.is_loaded() {
            purge = self.pool.add_to_eviction_queue(self);
        }
        drop(g);
        if purge {
            self.pool.purge_queue();
        }
    }
}

/// Guard over a locked block handle. All state transitions of the
/// handle happen through this guard.
pub struct BlockLock<'a> {
    handle: &'a BlockHandle,
    inner: MutexGuard<'a, BlockInner>,
}

impl BlockLock<'_> {
    /// Authoritative eligibility check, serialized against pin/unpin.
    #[inline]
    pub fn can_unload(&self) -> bool {
        self.handle.can_unload()
    }

    /// Byte size of the resident buffer, if any.
    #[inline]
    pub fn buffer_size(&self) -> Option<u64> {
        self.inner.buffer.as_ref().map(BlockBuffer::alloc_size)
    }

    #[inline]
    pub fn buffer(&self) -> Option<&BlockBuffer> {
        self.inner.buffer.as_ref()
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> Option<&mut BlockBuffer> {
        self.inner.buffer.as_mut()
    }

    /// Materialise the block: install the buffer and absorb the loader's
    /// reservation as the block's memory charge.
    #[inline]
    pub fn load(&mut self, buffer: BlockBuffer, reservation: BufferPoolReservation) {
        debug_assert!(self.handle.state() == BlockState::Unloaded);
        debug_assert!(self.inner.buffer.is_none());
        debug_assert!(reservation.size() == buffer.alloc_size());
        debug_assert!(reservation.tag() == self.handle.tag);
        self.inner.buffer = Some(buffer);
        self.inner.memory_charge.merge(reservation);
        self.handle
            .state
            .store(BlockState::Loaded as u8, Ordering::Release);
    }

    /// Release the block's memory back to the pool and mark it unloaded.
    #[inline]
    pub fn unload(&mut self) {
        let buffer = self.take_buffer_and_release_charge();
        drop(buffer);
        self.handle.pool.stats().unloaded_blocks_inc();
    }

    /// Like [`BlockLock::unload`], but hand the freed buffer back to the
    /// caller for direct reuse instead of deallocating it.
    #[inline]
    pub fn unload_and_take_buffer(&mut self) -> BlockBuffer {
        let buffer = self.take_buffer_and_release_charge();
        self.handle.pool.stats().recycled_buffers_inc();
        buffer
    }

    #[inline]
    fn take_buffer_and_release_charge(&mut self) -> BlockBuffer {
        debug_assert!(self.can_unload());
        let buffer = self.inner.buffer.take().expect("unload of resident block");
        debug_assert!(self.inner.memory_charge.size() == buffer.alloc_size());
        self.inner.memory_charge.resize(0);
        self.handle
            .state
            .store(BlockState::Unloaded as u8, Ordering::Release);
        buffer
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

    fn load_block(
        pool: &'static BufferPool,
        block_id: BlockId,
        size: u64,
    ) -> Arc<BlockHandle> {
        let res = pool.evict_blocks(MemoryTag::BaseTable, size, pool.max_memory(), None);
        assert!(res.success);
        let handle = BlockHandle::new(pool, block_id, MemoryTag::BaseTable);
        handle
            .lock()
            .load(BlockBuffer::allocate(size as usize), res.reservation);
        handle
    }

    #[test]
    fn test_block_pin_unpin() {
        let pool = new_pool(1024 * 1024);
        {
            let h = load_block(pool, 1, 4096);
            assert!(h.is_loaded());
            assert!(h.can_unload());

            assert!(h.pin());
            assert!(h.pin());
            assert_eq!(h.readers(), 2);
            assert!(!h.can_unload());

            h.unpin();
            assert!(!h.can_unload());
            h.unpin();
            assert!(h.can_unload());
            // only the unpin that reached zero enqueued the handle.
            assert_eq!(h.eviction_timestamp(), 1);
        }
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_block_unload_releases_memory() {
        let pool = new_pool(1024 * 1024);
        {
            let h = load_block(pool, 1, 4096);
            assert_eq!(pool.used_memory(), 4096);
            h.lock().unload();
            assert!(!h.is_loaded());
            assert_eq!(pool.used_memory(), 0);
            assert!(!h.pin());
        }
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_block_drop_releases_memory() {
        let pool = new_pool(1024 * 1024);
        {
            let h = load_block(pool, 1, 8192);
            assert_eq!(pool.used_memory(), 8192);
            drop(h);
            assert_eq!(pool.used_memory(), 0);
        }
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }

    #[test]
    fn test_block_reload_after_unload() {
        let pool = new_pool(1024 * 1024);
        {
            let h = load_block(pool, 1, 4096);
            let buffer = h.lock().unload_and_take_buffer();
            assert_eq!(buffer.alloc_size(), 4096);
            assert_eq!(pool.used_memory(), 0);

            let res = pool.evict_blocks(MemoryTag::BaseTable, 4096, pool.max_memory(), None);
            assert!(res.success);
            h.lock().load(buffer, res.reservation);
            assert!(h.is_loaded());
            assert_eq!(pool.used_memory(), 4096);
        }
        unsafe {
            StaticLifetime::drop_static(pool);
        }
    }
}
