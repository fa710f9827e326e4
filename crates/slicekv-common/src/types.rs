//! Core data types for SliceKV

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Maximum value length in bytes (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum number of backing data files per store.
pub const MAX_FILES: usize = 16;

/// Maximum number of data shards per store.
pub const MAX_SHARDS: u32 = 128;

/// A store key: an arbitrary byte string of at most [`MAX_KEY_SIZE`] bytes.
///
/// Keys order bytewise, which is the order range scans return entries in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Builds a key, rejecting oversized input with [`Error::KeyTooLong`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLong { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for StoreKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "StoreKey({s:?})"),
            Err(_) => write!(f, "StoreKey({} bytes)", self.0.len()),
        }
    }
}

/// Seconds since the Unix epoch, as used by the replication clock.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplTimestamp(pub u32);

impl ReplTimestamp {
    pub const ZERO: Self = Self(0);

    /// Current wall-clock time, truncated to seconds.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs as u32)
    }
}

/// The timestamp and candidate CAS value stamped onto a mutation.
///
/// Locally-originated mutations get one assigned by the owning shard's
/// timestamper; relayed mutations arrive with one already attached and
/// keep it unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastTime {
    pub timestamp: ReplTimestamp,
    pub proposed_cas: u64,
}

/// A stored value together with its CAS identity and write timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEntry {
    pub data: Vec<u8>,
    pub cas: u64,
    pub timestamp: ReplTimestamp,
}

/// How a set mutation treats a pre-existing entry under the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetPolicy {
    /// Store unconditionally.
    Upsert,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
}

/// A single write operation routed to exactly one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Set {
        key: StoreKey,
        value: Vec<u8>,
        policy: SetPolicy,
    },
    Delete {
        key: StoreKey,
    },
}

impl Mutation {
    /// The key this mutation targets, which determines its shard.
    pub fn key(&self) -> &StoreKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Outcome of applying a [`Mutation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationResult {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    TooLarge,
    NotAllowed,
}

impl MutationResult {
    /// True when the mutation changed the store.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Stored | Self::Deleted)
    }
}

/// A successful point read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub cas: u64,
    pub timestamp: ReplTimestamp,
}

/// Replication state persisted alongside each shard's data.
///
/// Scalar accessors on the store read and write shard 0's copy; the
/// replication clock read there at open seeds every shard's timestamper.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetadata {
    pub replication_clock: ReplTimestamp,
    pub last_sync: ReplTimestamp,
    pub master_id: u32,
    pub slave_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_length_limit() {
        assert!(StoreKey::new(vec![b'x'; MAX_KEY_SIZE]).is_ok());
        let err = StoreKey::new(vec![b'x'; MAX_KEY_SIZE + 1]).unwrap_err();
        assert!(matches!(err, Error::KeyTooLong { len } if len == MAX_KEY_SIZE + 1));
    }

    #[test]
    fn test_store_key_empty_is_valid() {
        let key = StoreKey::new(Vec::new()).unwrap();
        assert!(key.is_empty());
        assert_eq!(key.len(), 0);
    }

    #[test]
    fn test_store_key_ordering_is_bytewise() {
        let a = StoreKey::new(&b"abc"[..]).unwrap();
        let b = StoreKey::new(&b"abd"[..]).unwrap();
        let prefix = StoreKey::new(&b"ab"[..]).unwrap();
        assert!(a < b);
        assert!(prefix < a);

        let high = StoreKey::new(vec![0xffu8]).unwrap();
        let low = StoreKey::new(vec![0x01u8]).unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_mutation_key_accessor() {
        let key = StoreKey::new(&b"k"[..]).unwrap();
        let set = Mutation::Set {
            key: key.clone(),
            value: b"v".to_vec(),
            policy: SetPolicy::Upsert,
        };
        let del = Mutation::Delete { key: key.clone() };
        assert_eq!(set.key(), &key);
        assert_eq!(del.key(), &key);
    }

    #[test]
    fn test_mutation_result_success() {
        assert!(MutationResult::Stored.is_success());
        assert!(MutationResult::Deleted.is_success());
        assert!(!MutationResult::NotStored.is_success());
        assert!(!MutationResult::NotFound.is_success());
        assert!(!MutationResult::TooLarge.is_success());
        assert!(!MutationResult::NotAllowed.is_success());
    }

    #[test]
    fn test_repl_timestamp_now_is_monotonic_enough() {
        let a = ReplTimestamp::now();
        let b = ReplTimestamp::now();
        assert!(b >= a);
        assert!(a > ReplTimestamp::ZERO);
    }

    #[test]
    fn test_replication_metadata_default_is_zeroed() {
        let meta = ReplicationMetadata::default();
        assert_eq!(meta.replication_clock, ReplTimestamp::ZERO);
        assert_eq!(meta.last_sync, ReplTimestamp::ZERO);
        assert_eq!(meta.master_id, 0);
        assert_eq!(meta.slave_id, 0);
    }
}
