pub mod block;
pub mod evict;
pub mod reservation;
pub mod temp;

pub use block::{BlockBuffer, BlockHandle, BlockId, BlockLock, BlockState};
pub use evict::{BufferPool, BufferPoolConfig, BufferPoolStats, EvictionResult};
pub use reservation::BufferPoolReservation;
pub use temp::{TemporaryMemoryManager, TemporaryMemoryState};

/// Memory category a charge against the pool is accounted under.
///
/// Tags are a closed enumeration used for accounting only. The pool
/// tracks per-tag usage but never enforces per-tag limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryTag {
    BaseTable = 0,
    Index = 1,
    HashTable = 2,
    ColumnData = 3,
    Metadata = 4,
    Extension = 5,
    Temporary = 6,
}

impl MemoryTag {
    /// Number of memory tags. New tags require a rebuild.
    pub const COUNT: usize = 7;

    /// All tags, in accounting-array order.
    #[inline]
    pub const fn all() -> [MemoryTag; Self::COUNT] {
        [
            MemoryTag::BaseTable,
            MemoryTag::Index,
            MemoryTag::HashTable,
            MemoryTag::ColumnData,
            MemoryTag::Metadata,
            MemoryTag::Extension,
            MemoryTag::Temporary,
        ]
    }
}

impl From<u8> for MemoryTag {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => MemoryTag::BaseTable,
            1 => MemoryTag::Index,
            2 => MemoryTag::HashTable,
            3 => MemoryTag::ColumnData,
            4 => MemoryTag::Metadata,
            5 => MemoryTag::Extension,
            6 => MemoryTag::Temporary,
            _ => unreachable!("invalid memory tag"),
        }
    }
}
