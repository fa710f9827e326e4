//! SliceKV Engine - Persistence layer
//!
//! One store is backed by a small fixed set of data files. Each file is
//! owned by a [`FileSerializer`]; the [`SerializerMultiplexer`] stripes
//! per-shard slices across the files and hands out one
//! [`ProxySerializer`] per slice. On top of a proxy sits the
//! [`SliceBtree`], the ordered in-memory engine a shard actor drives.

pub mod btree;
pub mod serializer;

pub use btree::SliceBtree;
pub use serializer::{
    FileSerializer, ProxySerializer, SERIALIZER_MAGIC, SERIALIZER_VERSION, SerializerHeader,
    SerializerMultiplexer,
};
