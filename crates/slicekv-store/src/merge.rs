//! K-way merge over per-shard range streams
//!
//! Each data shard returns its slice of a range scan as an ordered
//! [`RangeStream`]. The merge buffers exactly one head entry per
//! stream, so the combined scan stays as lazy as its inputs: entries
//! the caller never pulls are never materialized beyond the per-shard
//! stream buffers.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use slicekv_common::StoreKey;

use crate::shard::RangeStream;

struct MergeHead {
    key: StoreKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeHead {}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges per-shard ordered streams into one ordered iterator.
///
/// Entries come out in global key order; equal keys from different
/// streams come out in stream-index order. The merge runs each input
/// to exhaustion exactly once and is not restartable. Dropping it
/// drops the streams, which stops any shard still scanning.
pub struct MergeIterator {
    streams: Vec<RangeStream>,
    heap: BinaryHeap<Reverse<MergeHead>>,
}

impl MergeIterator {
    pub(crate) fn new(mut streams: Vec<RangeStream>) -> Self {
        let mut heap = BinaryHeap::with_capacity(streams.len());
        for (source, stream) in streams.iter_mut().enumerate() {
            if let Some((key, value)) = stream.next() {
                heap.push(Reverse(MergeHead { key, value, source }));
            }
        }
        Self { streams, heap }
    }
}

impl Iterator for MergeIterator {
    type Item = (StoreKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(head) = self.heap.pop()?;
        if let Some((key, value)) = self.streams[head.source].next() {
            self.heap.push(Reverse(MergeHead {
                key,
                value,
                source: head.source,
            }));
        }
        Some((head.key, head.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(items: &[(&str, &str)]) -> RangeStream {
        let (tx, rx) = crossbeam_channel::unbounded();
        for (k, v) in items {
            tx.send((
                StoreKey::new(k.as_bytes().to_vec()).unwrap(),
                v.as_bytes().to_vec(),
            ))
            .unwrap();
        }
        drop(tx);
        RangeStream::new(rx)
    }

    fn collect_keys(merge: MergeIterator) -> Vec<String> {
        merge
            .map(|(k, _)| String::from_utf8(k.into_bytes()).unwrap())
            .collect()
    }

    #[test]
    fn test_merge_interleaves_streams_in_key_order() {
        let merge = MergeIterator::new(vec![
            stream_of(&[("a", "1"), ("d", "4"), ("e", "5")]),
            stream_of(&[("b", "2"), ("c", "3")]),
            stream_of(&[("f", "6")]),
        ]);
        assert_eq!(collect_keys(merge), ["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_merge_of_empty_streams_is_empty() {
        let merge = MergeIterator::new(vec![stream_of(&[]), stream_of(&[])]);
        assert_eq!(collect_keys(merge), Vec::<String>::new());

        let merge = MergeIterator::new(Vec::new());
        assert_eq!(collect_keys(merge), Vec::<String>::new());
    }

    #[test]
    fn test_merge_single_stream_passes_through() {
        let merge = MergeIterator::new(vec![stream_of(&[("a", "1"), ("b", "2")])]);
        let entries: Vec<(String, String)> = merge
            .map(|(k, v)| {
                (
                    String::from_utf8(k.into_bytes()).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            entries,
            [
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_equal_keys_break_ties_by_stream_position() {
        let merge = MergeIterator::new(vec![
            stream_of(&[("k", "from-0")]),
            stream_of(&[("k", "from-1")]),
        ]);
        let values: Vec<String> = merge.map(|(_, v)| String::from_utf8(v).unwrap()).collect();
        assert_eq!(values, ["from-0", "from-1"]);
    }
}
