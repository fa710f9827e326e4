//! Error types for SliceKV

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable errors surfaced to callers.
///
/// Internal invariant violations (mis-sized shard fan-out, rejected
/// metadata writes, order token regressions) are not represented here;
/// those panic, because continuing would corrupt the store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key exceeds maximum length: {len} bytes")]
    KeyTooLong { len: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("shard is stopped")]
    ShardStopped,
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
