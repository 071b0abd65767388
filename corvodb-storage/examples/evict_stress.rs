use clap::Parser;
use corvodb_storage::buffer::{BlockBuffer, BlockHandle, BufferPool, BufferPoolConfig, MemoryTag};
use corvodb_storage::lifetime::StaticLifetime;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(version, about = "Buffer-pool eviction and purge stress driver")]
struct Args {
    /// Number of worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
    /// Blocks loaded per thread.
    #[arg(long, default_value_t = 100_000)]
    blocks: usize,
    /// Pool budget in bytes.
    #[arg(long, default_value_t = 64usize * 1024 * 1024)]
    pool_bytes: usize,
    /// Size of one block in bytes.
    #[arg(long, default_value_t = 4096)]
    block_size: usize,
}

fn main() {
    let args = Args::parse();
    let pool = BufferPoolConfig::default()
        .max_mem_size(args.pool_bytes as u64)
        .build_static()
        .unwrap();

    let start = Instant::now();
    let mut handles = vec![];
    for thread_id in 0..args.threads {
        let blocks = args.blocks;
        let block_size = args.block_size;
        handles.push(thread::spawn(move || run_worker(pool, thread_id, blocks, block_size)));
    }
    let mut loaded = 0usize;
    for handle in handles {
        loaded += handle.join().unwrap();
    }
    let elapsed = start.elapsed();

    let stats = pool.stats();
    println!(
        "loaded {} blocks in {:?}: used {} / {} bytes, unloaded {}, recycled {}, purge passes {}, purged dead nodes {}",
        loaded,
        elapsed,
        pool.used_memory(),
        pool.max_memory(),
        stats.unloaded_blocks(),
        stats.recycled_buffers(),
        stats.purge_passes(),
        stats.purged_dead_nodes(),
    );

    unsafe {
        StaticLifetime::drop_static(pool);
    }
}

fn run_worker(
    pool: &'static BufferPool,
    thread_id: usize,
    blocks: usize,
    block_size: usize,
) -> usize {
    let mut rng = rand::rng();
    let mut resident: Vec<Arc<BlockHandle>> = vec![];
    let mut recycled = None;
    let mut loaded = 0;
    for i in 0..blocks {
        let res = pool.evict_blocks(
            MemoryTag::BaseTable,
            block_size as u64,
            pool.max_memory(),
            Some(&mut recycled),
        );
        if !res.success {
            continue;
        }
        let buffer = recycled
            .take()
            .unwrap_or_else(|| BlockBuffer::allocate(block_size));
        let handle = BlockHandle::new(pool, (thread_id * blocks + i) as u64, MemoryTag::BaseTable);
        handle.lock().load(buffer, res.reservation);
        if pool.add_to_eviction_queue(&handle) {
            pool.purge_queue();
        }
        resident.push(handle);
        loaded += 1;

        // touch a random resident block to perturb the LRU signal.
        if rng.random_bool(0.3) {
            let handle = &resident[rng.random_range(0..resident.len())];
            if handle.pin() {
                handle.unpin();
            }
        }
    }
    loaded
}
