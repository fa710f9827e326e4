//! SliceKV Common - Shared types and primitives
//!
//! This crate provides the pieces every other SliceKV crate builds on:
//! - Key and value types, mutations, and mutation results
//! - The key placement hash and shard routing
//! - Causal ordering tokens, sources, and sinks
//! - Store configuration and cache budgets
//! - Error types and cooperative shutdown signalling

pub mod config;
pub mod error;
pub mod hash;
pub mod order;
pub mod shutdown;
pub mod types;

pub use config::{CacheConfig, StoreConfig};
pub use error::{Error, Result};
pub use hash::{hash_key, shard_for_key};
pub use order::{OrderSink, OrderSource, OrderToken};
pub use shutdown::ShutdownSignal;
pub use types::{
    CastTime, GetResult, MAX_FILES, MAX_KEY_SIZE, MAX_SHARDS, MAX_VALUE_SIZE, Mutation,
    MutationResult, ReplTimestamp, ReplicationMetadata, SetPolicy, StoreKey, ValueEntry,
};
