use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(
        "failed to change memory limit to {0}: could not free up enough memory for the new limit{1}"
    )]
    MemoryLimitChangeFailed(u64, String),
    #[error("insufficient memory({0})")]
    InsufficientMemory(u64),
    #[error("buffer pool size is too small")]
    BufferPoolSizeTooSmall,
}
