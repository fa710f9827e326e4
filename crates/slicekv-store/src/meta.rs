//! Metadata facade
//!
//! Small string-keyed records (replication bookkeeping, persisted stat
//! counters) live in the reserved metadata shard, reached through these
//! accessors instead of key routing. Metadata traffic carries ignore
//! tokens: it has no causal position in any client's history.
//!
//! The scalar replication accessors read and write shard 0's copy of
//! the replication state, matching where the open path looks for the
//! clock it seeds the timestampers with.

use slicekv_common::{
    Mutation, MutationResult, OrderToken, ReplTimestamp, ReplicationMetadata, Result, SetPolicy,
    StoreKey,
};

use crate::store::KeyValueStore;

impl KeyValueStore {
    /// Reads a metadata record. Oversized names report
    /// [`slicekv_common::Error::KeyTooLong`]; absent records are `None`.
    pub fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let key = StoreKey::new(name.as_bytes())?;
        let got = self
            .metadata_shard
            .handle()
            .get(key, OrderToken::ignore())?;
        Ok(got.map(|result| result.value))
    }

    /// Writes a metadata record unconditionally.
    pub fn set_meta(&self, name: &str, value: &[u8]) -> Result<()> {
        let mutation = Mutation::Set {
            key: StoreKey::new(name.as_bytes())?,
            value: value.to_vec(),
            policy: SetPolicy::Upsert,
        };
        let result = self
            .metadata_shard
            .handle()
            .change(mutation, OrderToken::ignore())?;
        // an upsert that does not store means the store is broken
        assert!(
            result == MutationResult::Stored,
            "metadata upsert rejected: {result:?}"
        );
        Ok(())
    }

    pub fn replication_metadata(&self) -> Result<ReplicationMetadata> {
        self.shards[0].handle().replication_metadata()
    }

    pub fn get_replication_clock(&self) -> Result<ReplTimestamp> {
        Ok(self.replication_metadata()?.replication_clock)
    }

    pub fn set_replication_clock(&self, clock: ReplTimestamp) -> Result<()> {
        self.shards[0].handle().set_replication_clock(clock)
    }

    pub fn get_last_sync(&self) -> Result<ReplTimestamp> {
        Ok(self.replication_metadata()?.last_sync)
    }

    pub fn set_last_sync(&self, last_sync: ReplTimestamp) -> Result<()> {
        self.shards[0].handle().set_last_sync(last_sync)
    }

    pub fn get_replication_master_id(&self) -> Result<u32> {
        Ok(self.replication_metadata()?.master_id)
    }

    pub fn set_replication_master_id(&self, master_id: u32) -> Result<()> {
        self.shards[0].handle().set_master_id(master_id)
    }

    pub fn get_replication_slave_id(&self) -> Result<u32> {
        Ok(self.replication_metadata()?.slave_id)
    }

    pub fn set_replication_slave_id(&self, slave_id: u32) -> Result<()> {
        self.shards[0].handle().set_slave_id(slave_id)
    }
}
