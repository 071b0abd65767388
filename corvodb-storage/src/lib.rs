pub mod buffer;
pub mod error;
pub mod lifetime;

pub mod prelude {
    pub use crate::buffer::block::{BlockBuffer, BlockHandle, BlockState};
    pub use crate::buffer::evict::{BufferPool, BufferPoolConfig, EvictionResult};
    pub use crate::buffer::reservation::BufferPoolReservation;
    pub use crate::buffer::temp::TemporaryMemoryState;
    pub use crate::buffer::MemoryTag;
    pub use crate::error::*;
}
