use crate::buffer::block::{BlockBuffer, BlockHandle};
use crate::buffer::reservation::BufferPoolReservation;
use crate::buffer::temp::{TemporaryMemoryManager, TemporaryMemoryState};
use crate::buffer::MemoryTag;
use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use byte_unit::Byte;
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Queue insertions between two purge triggers.
pub const INSERT_INTERVAL: u64 = 1024;
/// How many nodes one purge pass targets per inserted node. Purging more
/// than was inserted keeps purges from triggering further purges.
pub const PURGE_SIZE_MULTIPLIER: u64 = 2;
/// Minimum ratio of queue size to purge size required to purge at all.
/// Purging a short queue would discard the best eviction candidates.
pub const EARLY_OUT_MULTIPLIER: u64 = 4;
/// Entry threshold of the aggressive purge mode, as 1 alive node per
/// `ALIVE_NODE_MULTIPLIER` dead nodes.
pub const ALIVE_NODE_MULTIPLIER: u64 = 4;

/// Queue entry referring to one enqueue of a block handle.
///
/// The weak back-reference never extends the handle's lifetime. A node is
/// alive iff the reference still resolves and its timestamp matches the
/// handle's current eviction timestamp; otherwise it is a tombstone.
#[derive(Debug)]
pub struct EvictionNode {
    handle: Weak<BlockHandle>,
    timestamp: u64,
}

impl EvictionNode {
    #[inline]
    pub(crate) fn new(handle: Weak<BlockHandle>, timestamp: u64) -> Self {
        EvictionNode { handle, timestamp }
    }

    /// True iff this node is the latest queue entry of `handle` and the
    /// handle itself is eligible for eviction.
    #[inline]
    pub fn can_unload(&self, handle: &BlockHandle) -> bool {
        if self.timestamp != handle.eviction_timestamp() {
            // handle was re-enqueued in between, this entry is stale.
            return false;
        }
        handle.can_unload()
    }

    /// Upgrade the weak reference, filtering obvious tombstones.
    ///
    /// The caller must still re-check [`EvictionNode::can_unload`] under
    /// the handle lock before unloading.
    #[inline]
    pub fn try_get_block_handle(&self) -> Option<Arc<BlockHandle>> {
        let handle = self.handle.upgrade()?;
        if !self.can_unload(&handle) {
            return None;
        }
        Some(handle)
    }
}

/// Unbounded lock-free MPMC FIFO of eviction nodes.
///
/// Order is a hint, not a contract: concurrent producers interleave and
/// purge passes move surviving nodes to the tail.
#[derive(Debug)]
struct EvictionQueue {
    q: SegQueue<EvictionNode>,
}

impl EvictionQueue {
    #[inline]
    fn new() -> Self {
        EvictionQueue { q: SegQueue::new() }
    }

    #[inline]
    fn enqueue(&self, node: EvictionNode) {
        self.q.push(node);
    }

    #[inline]
    fn try_dequeue(&self) -> Option<EvictionNode> {
        self.q.pop()
    }

    #[inline]
    fn enqueue_bulk(&self, nodes: impl Iterator<Item = EvictionNode>) {
        for node in nodes {
            self.q.push(node);
        }
    }

    /// Dequeue up to `max` nodes into `out`. Returns the number dequeued.
    #[inline]
    fn try_dequeue_bulk(&self, out: &mut Vec<EvictionNode>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.q.pop() {
                Some(node) => {
                    out.push(node);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Cheap racy size estimate.
    #[inline]
    fn size_approx(&self) -> usize {
        self.q.len()
    }
}

/// Outcome of [`BufferPool::evict_blocks`].
///
/// On failure the reservation has already been resized to zero.
pub struct EvictionResult {
    pub success: bool,
    pub reservation: BufferPoolReservation,
}

/// Bounded-memory concurrent page cache.
///
/// Keeps hot blocks resident and evicts cold ones under pressure. Eviction
/// order approximates LRU: producer interleaving, purge re-enqueues and
/// tombstone skipping all perturb strict ordering.
#[derive(Debug)]
pub struct BufferPool {
    // Total bytes currently charged to the pool.
    current_memory: CachePadded<AtomicU64>,
    // Soft budget. Written only under limit_lock, read racily elsewhere.
    maximum_memory: AtomicU64,
    memory_usage_per_tag: [AtomicU64; MemoryTag::COUNT],
    queue: EvictionQueue,
    temporary_memory_manager: TemporaryMemoryManager,
    // Insertions since the last purge initiation. Estimate only, may go
    // negative under race.
    evict_queue_insertions: CachePadded<AtomicI64>,
    // Estimate of tombstones currently in the queue.
    total_dead_nodes: AtomicI64,
    // Single-purger handshake. At most one thread holds it at a time.
    purge_active: AtomicBool,
    // Scratch vector reused across purge passes. Owned by whichever
    // thread currently holds purge_active, so the lock is uncontended.
    purge_nodes: Mutex<Vec<EvictionNode>>,
    limit_lock: Mutex<()>,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a pool with given soft memory budget in bytes.
    #[inline]
    pub fn new(maximum_memory: u64) -> Self {
        BufferPool {
            current_memory: CachePadded::new(AtomicU64::new(0)),
            maximum_memory: AtomicU64::new(maximum_memory),
            memory_usage_per_tag: std::array::from_fn(|_| AtomicU64::new(0)),
            queue: EvictionQueue::new(),
            temporary_memory_manager: TemporaryMemoryManager::new(),
            evict_queue_insertions: CachePadded::new(AtomicI64::new(0)),
            total_dead_nodes: AtomicI64::new(0),
            purge_active: AtomicBool::new(false),
            purge_nodes: Mutex::new(Vec::new()),
            limit_lock: Mutex::new(()),
            stats: BufferPoolStats::default(),
        }
    }

    /// Total bytes currently charged to the pool.
    #[inline]
    pub fn used_memory(&self) -> u64 {
        self.current_memory.load(Ordering::Acquire)
    }

    /// Current soft budget in bytes.
    #[inline]
    pub fn max_memory(&self) -> u64 {
        self.maximum_memory.load(Ordering::Acquire)
    }

    /// Upper bound for one query's working set. Equal to the pool budget.
    #[inline]
    pub fn query_max_memory(&self) -> u64 {
        self.max_memory()
    }

    /// Bytes charged under one tag.
    #[inline]
    pub fn used_memory_by_tag(&self, tag: MemoryTag) -> u64 {
        self.memory_usage_per_tag[tag as usize].load(Ordering::Acquire)
    }

    #[inline]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    #[inline]
    pub fn temporary_memory_manager(&self) -> &TemporaryMemoryManager {
        &self.temporary_memory_manager
    }

    /// Register a new consumer of transient per-query memory.
    #[inline]
    pub fn new_temporary_memory_state(&'static self) -> TemporaryMemoryState {
        self.temporary_memory_manager.register(self)
    }

    /// Charge `size` bytes under `tag`. Never fails, never blocks.
    /// Callers must have reserved the budget via
    /// [`BufferPool::evict_blocks`] first.
    #[inline]
    pub fn increase_used_memory(&self, tag: MemoryTag, size: u64) {
        self.current_memory.fetch_add(size, Ordering::AcqRel);
        self.memory_usage_per_tag[tag as usize].fetch_add(size, Ordering::Relaxed);
    }

    /// Release `size` bytes charged under `tag`.
    #[inline]
    pub fn decrease_used_memory(&self, tag: MemoryTag, size: u64) {
        let prev = fetch_sub_saturating(&self.current_memory, size);
        debug_assert!(prev >= size, "current memory underflow");
        let prev_tag = fetch_sub_saturating(&self.memory_usage_per_tag[tag as usize], size);
        debug_assert!(prev_tag >= size, "per-tag memory underflow");
    }

    /// Insert `handle` into the eviction queue.
    ///
    /// Must be called with `handle.readers == 0` and either the handle
    /// lock held or the handle not yet shared. Returns true when the
    /// caller should follow up with [`BufferPool::purge_queue`].
    #[inline]
    pub fn add_to_eviction_queue(&self, handle: &Arc<BlockHandle>) -> bool {
        debug_assert!(handle.readers() == 0);
        let ts = handle.bump_eviction_timestamp();
        self.queue
            .enqueue(EvictionNode::new(Arc::downgrade(handle), ts));
        if ts != 1 {
            // the new entry tombstones exactly one prior entry.
            self.total_dead_nodes.fetch_add(1, Ordering::Relaxed);
        }
        self.evict_queue_insertions.fetch_add(1, Ordering::Relaxed) + 1 >= INSERT_INTERVAL as i64
    }

    /// Bring `current_memory` down to `memory_limit` while reserving
    /// `extra_memory` bytes under `tag` for the caller.
    ///
    /// The reservation is charged before any eviction so that two
    /// concurrent callers cannot both conclude the same headroom is
    /// free. When `reuse_buffer` is provided and a victim's allocation
    /// size equals `extra_memory`, the victim's buffer is handed back
    /// directly, skipping one free/alloc round-trip.
    ///
    /// Never errors: failure to free enough memory is reported through
    /// [`EvictionResult::success`], with the reservation zeroed.
    pub fn evict_blocks(
        &'static self,
        tag: MemoryTag,
        extra_memory: u64,
        memory_limit: u64,
        mut reuse_buffer: Option<&mut Option<BlockBuffer>>,
    ) -> EvictionResult {
        let mut reservation = BufferPoolReservation::new(self, tag, extra_memory);

        while self.used_memory() > memory_limit {
            // fast path first, then the aggressive retry that excludes a
            // concurrent purge.
            let node = match self.queue.try_dequeue() {
                Some(node) => node,
                None => match self.try_dequeue_without_concurrent_purge() {
                    Some(node) => node,
                    None => {
                        // the queue is effectively empty, give up.
                        reservation.resize(0);
                        return EvictionResult {
                            success: false,
                            reservation,
                        };
                    }
                },
            };

            self.evict_queue_insertions.fetch_sub(1, Ordering::Relaxed);

            let handle = match node.try_get_block_handle() {
                Some(handle) => handle,
                None => {
                    self.total_dead_nodes.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
            };

            // grab the handle lock and re-verify before unloading.
            let mut block = handle.lock();
            if !node.can_unload(&handle) {
                self.total_dead_nodes.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            match reuse_buffer {
                Some(ref mut out) if block.buffer_size() == Some(extra_memory) => {
                    **out = Some(block.unload_and_take_buffer());
                    return EvictionResult {
                        success: true,
                        reservation,
                    };
                }
                _ => block.unload(),
            }
        }

        EvictionResult {
            success: true,
            reservation,
        }
    }

    /// Dequeue one node while excluding any concurrent purge.
    ///
    /// Not a lock in the classical sense: a single-mutator handshake on
    /// top of the MPMC queue, used only when the fast path fails while a
    /// purge may be holding many nodes out of the queue.
    fn try_dequeue_without_concurrent_purge(&self) -> Option<EvictionNode> {
        while self
            .purge_active
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let node = self.queue.try_dequeue();
        self.purge_active.store(false, Ordering::Release);
        node
    }

    /// Bulk-collect tombstones from the queue.
    ///
    /// Only one thread purges at a time; all others return immediately.
    pub fn purge_queue(&self) {
        loop {
            if self.purge_active.load(Ordering::Acquire) {
                return;
            }
            if self
                .purge_active
                .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        // insertions since the previous purge, expected to be around
        // INSERT_INTERVAL.
        let queue_insertions = self
            .evict_queue_insertions
            .fetch_sub(INSERT_INTERVAL as i64, Ordering::Relaxed)
            .max(0) as u64;
        let purge_size = queue_insertions * PURGE_SIZE_MULTIPLIER;
        if purge_size == 0 {
            self.purge_active.store(false, Ordering::Release);
            return;
        }

        let mut approx_q_size = self.queue.size_approx() as u64;

        // a short queue holds the most recent eviction candidates, purging
        // it would destroy the LRU signal.
        if approx_q_size < purge_size * EARLY_OUT_MULTIPLIER {
            self.purge_active.store(false, Ordering::Release);
            return;
        }

        // Usually a single pass purging slightly more than was inserted is
        // enough. When dead nodes accumulate faster than that, keep
        // purging until the queue is short again, the alive/dead ratio
        // recovered, or the whole queue was walked once.
        let mut max_purges = approx_q_size / purge_size;
        while max_purges != 0 {
            self.purge_iteration(purge_size as usize);
            self.stats.purge_passes.fetch_add(1, Ordering::Relaxed);

            approx_q_size = self.queue.size_approx() as u64;
            if approx_q_size < purge_size * EARLY_OUT_MULTIPLIER {
                break;
            }

            let approx_dead_nodes =
                (self.total_dead_nodes.load(Ordering::Relaxed).max(0) as u64).min(approx_q_size);
            let approx_alive_nodes = approx_q_size - approx_dead_nodes;

            // exit ratio 1:(ALIVE_NODE_MULTIPLIER - 1) is stricter than the
            // 1:ALIVE_NODE_MULTIPLIER entry ratio, damping oscillation.
            if approx_alive_nodes * (ALIVE_NODE_MULTIPLIER - 1) > approx_dead_nodes {
                break;
            }

            max_purges -= 1;
        }

        self.purge_active.store(false, Ordering::Release);
    }

    /// One bounded purge pass: bulk-dequeue up to `purge_size` nodes,
    /// drop the tombstones and re-enqueue the survivors at the tail.
    /// Survivors lose their queue position; the queue offers no in-place
    /// filter.
    fn purge_iteration(&self, purge_size: usize) {
        // uncontended: only the purge_active winner reaches this lock.
        let mut nodes = self.purge_nodes.lock();
        debug_assert!(nodes.is_empty());

        // keep the scratch capacity close to the steady-state purge size.
        if purge_size < nodes.capacity() / 2 {
            nodes.shrink_to(purge_size);
        } else if purge_size > nodes.capacity() {
            nodes.reserve_exact(purge_size);
        }

        let actually_dequeued = self.queue.try_dequeue_bulk(&mut nodes, purge_size);

        // keep alive nodes in order, drop the rest.
        nodes.retain(|node| node.try_get_block_handle().is_some());
        let alive_nodes = nodes.len();

        self.queue.enqueue_bulk(nodes.drain(..));

        let purged = (actually_dequeued - alive_nodes) as i64;
        self.total_dead_nodes.fetch_sub(purged, Ordering::Relaxed);
        self.stats
            .purged_dead_nodes
            .fetch_add(purged as u64, Ordering::Relaxed);
    }

    /// Change the soft memory budget.
    ///
    /// Evicts down to `limit` before publishing the new budget, then once
    /// more to absorb allocations that raced in between. When the second
    /// eviction fails, the old budget is restored. The per-tag and total
    /// counters are never rolled back.
    pub fn set_limit(&'static self, limit: u64, postscript: &str) -> Result<()> {
        let _limit_guard = self.limit_lock.lock();
        if !self
            .evict_blocks(MemoryTag::Extension, 0, limit, None)
            .success
        {
            return Err(Error::MemoryLimitChangeFailed(limit, postscript.to_string()));
        }
        let old_limit = self.maximum_memory.load(Ordering::Acquire);
        self.maximum_memory.store(limit, Ordering::Release);
        if !self
            .evict_blocks(MemoryTag::Extension, 0, limit, None)
            .success
        {
            self.maximum_memory.store(old_limit, Ordering::Release);
            return Err(Error::MemoryLimitChangeFailed(limit, postscript.to_string()));
        }
        Ok(())
    }
}

unsafe impl StaticLifetime for BufferPool {}

/// Subtract without wrapping below zero. Returns the prior value.
#[inline]
fn fetch_sub_saturating(counter: &AtomicU64, size: u64) -> u64 {
    let mut prev = counter.load(Ordering::Acquire);
    loop {
        let next = prev.saturating_sub(size);
        match counter.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return prev,
            Err(v) => prev = v,
        }
    }
}

/// Counters of eviction and purge activity.
#[derive(Default, Debug)]
pub struct BufferPoolStats {
    unloaded_blocks: AtomicU64,
    recycled_buffers: AtomicU64,
    purge_passes: AtomicU64,
    purged_dead_nodes: AtomicU64,
}

impl BufferPoolStats {
    #[inline]
    pub fn unloaded_blocks(&self) -> u64 {
        self.unloaded_blocks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recycled_buffers(&self) -> u64 {
        self.recycled_buffers.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn purge_passes(&self) -> u64 {
        self.purge_passes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn purged_dead_nodes(&self) -> u64 {
        self.purged_dead_nodes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn unloaded_blocks_inc(&self) {
        self.unloaded_blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn recycled_buffers_inc(&self) {
        self.recycled_buffers.fetch_add(1, Ordering::Relaxed);
    }
}

const DEFAULT_MAX_MEM_SIZE: Byte = Byte::from_u64(1024 * 1024 * 1024); // by default 1GB
const MIN_POOL_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    max_mem_size: Byte,
}

impl Default for BufferPoolConfig {
    #[inline]
    fn default() -> Self {
        BufferPoolConfig {
            max_mem_size: DEFAULT_MAX_MEM_SIZE,
        }
    }
}

impl BufferPoolConfig {
    #[inline]
    pub fn max_mem_size<T>(mut self, max_mem_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.max_mem_size = Byte::from(max_mem_size);
        self
    }

    #[inline]
    pub fn build(self) -> Result<BufferPool> {
        let max_mem_size = self.max_mem_size.as_u64();
        if max_mem_size < MIN_POOL_SIZE {
            return Err(Error::BufferPoolSizeTooSmall);
        }
        Ok(BufferPool::new(max_mem_size))
    }

    /// Build the pool, leak it to the heap and return the static
    /// reference.
    #[inline]
    pub fn build_static(self) -> Result<&'static BufferPool> {
        let pool = self.build()?;
        Ok(StaticLifetime::new_static(pool))
    }
}
