//! Cache budget partitioning
//!
//! The store is configured with one [`CacheConfig`] covering all
//! shards. At open that budget splits into equal portions for the data
//! shards plus a small reserved portion for the metadata shard, sized
//! relative to a single data shard by a fixed quotient.

use slicekv_common::CacheConfig;

/// Metadata shard budget as a fraction of the whole store's budget,
/// before normalization against the data shards.
pub const METADATA_SHARD_RESOURCE_QUOTIENT: f32 = 0.01;

/// Fraction of the total budget granted to each data shard and to the
/// metadata shard. `n_shards` data portions plus the metadata portion
/// sum to roughly 1.
pub fn resource_shares(n_shards: u32) -> (f32, f32) {
    let n = n_shards as f32;
    let total = 1.0 + METADATA_SHARD_RESOURCE_QUOTIENT / n;
    (
        1.0 / (n * total),
        METADATA_SHARD_RESOURCE_QUOTIENT / total,
    )
}

/// Scales every budget field by `share`, flooring fractions and
/// clamping to at least 1 so no shard ends up with a zero budget it
/// would interpret as "flush on every write" or "no IO slots".
pub fn partition_cache_config(total: &CacheConfig, share: f32) -> CacheConfig {
    CacheConfig {
        max_size: scale_u64(total.max_size, share),
        max_dirty_size: scale_u64(total.max_dirty_size, share),
        flush_dirty_size: scale_u64(total.flush_dirty_size, share),
        io_priority_reads: scale_u32(total.io_priority_reads, share),
        io_priority_writes: scale_u32(total.io_priority_writes, share),
        delete_queue_limit: scale_u64(total.delete_queue_limit, share),
    }
}

fn scale_u64(value: u64, share: f32) -> u64 {
    (((value as f32) * share).floor() as u64).max(1)
}

fn scale_u32(value: u32, share: f32) -> u32 {
    (((value as f32) * share).floor() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shares_sum_to_roughly_one() {
        for n_shards in [1u32, 2, 4, 8, 64, 128] {
            let (data, meta) = resource_shares(n_shards);
            let sum = data * n_shards as f32 + meta;
            assert!(
                (0.999..=1.011).contains(&sum),
                "n_shards={n_shards} sum={sum}"
            );
            assert!(data > 0.0);
            assert!(meta > 0.0);
            assert!(meta < data, "metadata portion must stay below a data shard's");
        }
    }

    #[test]
    fn test_partition_is_deterministic() {
        let total = CacheConfig::default();
        let (data, _) = resource_shares(8);
        assert_eq!(
            partition_cache_config(&total, data),
            partition_cache_config(&total, data)
        );
    }

    #[test]
    fn test_partitioned_budgets_never_hit_zero() {
        let tiny = CacheConfig {
            max_size: 1,
            max_dirty_size: 1,
            flush_dirty_size: 1,
            io_priority_reads: 1,
            io_priority_writes: 1,
            delete_queue_limit: 1,
        };
        let (data, meta) = resource_shares(128);
        for share in [data, meta] {
            let part = partition_cache_config(&tiny, share);
            assert!(part.max_size >= 1);
            assert!(part.max_dirty_size >= 1);
            assert!(part.flush_dirty_size >= 1);
            assert!(part.io_priority_reads >= 1);
            assert!(part.io_priority_writes >= 1);
            assert!(part.delete_queue_limit >= 1);
        }
    }

    #[test]
    fn test_partitioned_budgets_roughly_reassemble() {
        let total = CacheConfig::default();
        for n_shards in [1u32, 4, 16] {
            let (data_share, meta_share) = resource_shares(n_shards);
            let data = partition_cache_config(&total, data_share);
            let meta = partition_cache_config(&total, meta_share);
            let reassembled = data.max_size * u64::from(n_shards) + meta.max_size;
            let slack = u64::from(n_shards) + 1;
            assert!(
                reassembled <= total.max_size + slack,
                "n_shards={n_shards} reassembled={reassembled}"
            );
            assert!(
                reassembled + slack >= total.max_size * 99 / 100,
                "n_shards={n_shards} reassembled={reassembled}"
            );
        }
    }
}
