//! Write-buffer representations.
//!
//! The engine buffers writes in one of three interchangeable in-memory
//! structures: an unsorted append-only array, a concurrent skip list, and a
//! hash-partitioned collection of skip lists keyed by a key prefix. All
//! three present the same interface so the engine (and the benchmark
//! driving it) can swap them freely.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;

use crate::error::{Error, Result};

/// An owned key/value pair.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Modeled per-entry container overhead charged on top of raw key/value
/// bytes, in the spirit of an engine's arena accounting. The array pays two
/// `Vec` headers per entry; the skip lists additionally pay an estimated
/// tower/index cost per node.
pub const VECTOR_ENTRY_OVERHEAD: usize = mem::size_of::<Entry>();
pub const SKIPLIST_ENTRY_OVERHEAD: usize = mem::size_of::<Entry>() + 64;

/// The write-buffer structures the engine can be configured with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Vector = 1,
    SkipList = 2,
    HashSkipList = 3,
}

impl Representation {
    /// Suffix appended to the engine directory name for this representation,
    /// so runs from different representations never share a directory.
    pub fn dir_suffix(&self) -> &'static str {
        match self {
            Representation::Vector => "vector",
            Representation::SkipList => "skiplist",
            Representation::HashSkipList => "hash_skiplist",
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Representation::Vector => "Vector",
            Representation::SkipList => "SkipList",
            Representation::HashSkipList => "HashSkipList",
        };
        write!(f, "{name}")
    }
}

/// Construction recipe for a representation. The engine rebuilds the active
/// memtable from this every time it freezes the current one.
#[derive(Debug, Clone)]
pub struct RepConfig {
    pub representation: Representation,
    /// Entry slots reserved up front by the array representation.
    pub vector_preallocation: usize,
    /// Bucket count for the hash-partitioned representation.
    pub bucket_count: usize,
    /// Key prefix length hashed to pick a bucket. Zero means unset.
    pub prefix_len: usize,
}

impl RepConfig {
    pub fn build(&self) -> Result<Arc<dyn MemtableRep>> {
        match self.representation {
            Representation::Vector => Ok(Arc::new(VectorRep::new(self.vector_preallocation))),
            Representation::SkipList => Ok(Arc::new(SkipListRep::new())),
            Representation::HashSkipList => Ok(Arc::new(HashSkipListRep::new(
                self.bucket_count,
                self.prefix_len,
            )?)),
        }
    }
}

/// A write buffer the engine can insert into, read from and drain.
///
/// Implementations are internally synchronized; the engine shares them
/// across its write path and background workers behind an `Arc`.
pub trait MemtableRep: Send + Sync {
    /// Inserts a pair. The newest write for a key wins on reads.
    fn insert(&self, key: Vec<u8>, value: Vec<u8>);

    /// Point lookup honoring newest-write-wins.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Number of resident entries. The array representation counts every
    /// append, including superseded writes for the same key.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate resident bytes including modeled container overhead. The
    /// engine compares this against its configured write-buffer capacity.
    fn approximate_bytes(&self) -> usize;

    /// Owned forward cursor positioned at the first key `>= start`.
    fn iter_from(&self, start: &[u8]) -> Box<dyn Iterator<Item = Entry> + Send>;

    /// Sorted snapshot of the whole table with superseded writes dropped.
    fn sorted_entries(&self) -> Vec<Entry>;
}

/// Unsorted append-only array. Inserts are O(1) pushes; every ordered
/// operation pays a full copy and sort, which is exactly the trade the
/// benchmark exists to measure.
pub struct VectorRep {
    entries: Mutex<Vec<Entry>>,
    bytes: AtomicUsize,
}

impl VectorRep {
    pub fn new(preallocated_entries: usize) -> VectorRep {
        VectorRep {
            entries: Mutex::new(Vec::with_capacity(preallocated_entries)),
            bytes: AtomicUsize::new(0),
        }
    }
}

impl MemtableRep for VectorRep {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.bytes.fetch_add(
            key.len() + value.len() + VECTOR_ENTRY_OVERHEAD,
            Ordering::Relaxed,
        );
        self.entries.lock().unwrap().push((key, value));
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        // The array is unsorted, so scan backwards to find the newest write.
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .rev()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.clone())
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn approximate_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn iter_from(&self, start: &[u8]) -> Box<dyn Iterator<Item = Entry> + Send> {
        let sorted = self.sorted_entries();
        let from = sorted.partition_point(|(k, _)| k.as_slice() < start);
        Box::new(sorted.into_iter().skip(from))
    }

    fn sorted_entries(&self) -> Vec<Entry> {
        sort_dedup(self.entries.lock().unwrap().clone())
    }
}

/// Stable-sorts by key and keeps only the last (newest) write for each key.
fn sort_dedup(mut entries: Vec<Entry>) -> Vec<Entry> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut deduped: Vec<Entry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match deduped.last_mut() {
            Some(last) if last.0 == entry.0 => *last = entry,
            _ => deduped.push(entry),
        }
    }
    deduped
}

/// Concurrent skip list. Keeps entries sorted at all times, so ordered
/// cursors and drains are cheap.
pub struct SkipListRep {
    map: Arc<SkipMap<Vec<u8>, Vec<u8>>>,
    bytes: AtomicUsize,
}

impl SkipListRep {
    pub fn new() -> SkipListRep {
        SkipListRep {
            map: Arc::new(SkipMap::new()),
            bytes: AtomicUsize::new(0),
        }
    }
}

impl Default for SkipListRep {
    fn default() -> SkipListRep {
        SkipListRep::new()
    }
}

impl MemtableRep for SkipListRep {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.bytes.fetch_add(
            key.len() + value.len() + SKIPLIST_ENTRY_OVERHEAD,
            Ordering::Relaxed,
        );
        self.map.insert(key, value);
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn approximate_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn iter_from(&self, start: &[u8]) -> Box<dyn Iterator<Item = Entry> + Send> {
        Box::new(SkipCursor {
            map: Arc::clone(&self.map),
            next_from: Bound::Included(start.to_vec()),
        })
    }

    fn sorted_entries(&self) -> Vec<Entry> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Lazy cursor over a shared skip list. Holding the map behind an `Arc`
/// keeps the cursor owned and `Send`; each step re-enters the map just past
/// the previously yielded key.
struct SkipCursor {
    map: Arc<SkipMap<Vec<u8>, Vec<u8>>>,
    next_from: Bound<Vec<u8>>,
}

impl Iterator for SkipCursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = self
            .map
            .range((self.next_from.clone(), Bound::Unbounded))
            .next()?;
        let key = entry.key().clone();
        let value = entry.value().clone();
        self.next_from = Bound::Excluded(key.clone());
        Some((key, value))
    }
}

/// Skip lists partitioned by a hash of the key prefix. Point operations
/// touch a single bucket; ordered scans must consult every bucket per step.
pub struct HashSkipListRep {
    buckets: Vec<Arc<SkipMap<Vec<u8>, Vec<u8>>>>,
    prefix_len: usize,
    bytes: AtomicUsize,
}

impl HashSkipListRep {
    pub fn new(bucket_count: usize, prefix_len: usize) -> Result<HashSkipListRep> {
        if prefix_len == 0 {
            return Err(Error::MissingPrefixLength);
        }
        let buckets = (0..bucket_count.max(1))
            .map(|_| Arc::new(SkipMap::new()))
            .collect();
        Ok(HashSkipListRep {
            buckets,
            prefix_len,
            bytes: AtomicUsize::new(0),
        })
    }

    fn bucket(&self, key: &[u8]) -> &Arc<SkipMap<Vec<u8>, Vec<u8>>> {
        let prefix = &key[..key.len().min(self.prefix_len)];
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }
}

impl MemtableRep for HashSkipListRep {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.bytes.fetch_add(
            key.len() + value.len() + SKIPLIST_ENTRY_OVERHEAD,
            Ordering::Relaxed,
        );
        self.bucket(&key).insert(key, value);
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.bucket(key).get(key).map(|entry| entry.value().clone())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    fn approximate_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn iter_from(&self, start: &[u8]) -> Box<dyn Iterator<Item = Entry> + Send> {
        Box::new(HashCursor {
            buckets: self.buckets.clone(),
            next_from: Bound::Included(start.to_vec()),
        })
    }

    fn sorted_entries(&self) -> Vec<Entry> {
        // A key always lands in the same bucket, so concatenating the
        // buckets cannot produce duplicates; a single sort restores order.
        let mut entries: Vec<Entry> = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.iter() {
                entries.push((entry.key().clone(), entry.value().clone()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Ordered cursor over the partitioned buckets. Each step probes every
/// bucket for its smallest remaining key, which is the ordered-scan cost of
/// hash partitioning.
struct HashCursor {
    buckets: Vec<Arc<SkipMap<Vec<u8>, Vec<u8>>>>,
    next_from: Bound<Vec<u8>>,
}

impl Iterator for HashCursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let mut best: Option<Entry> = None;
        for bucket in &self.buckets {
            if let Some(entry) = bucket
                .range((self.next_from.clone(), Bound::Unbounded))
                .next()
            {
                let better = match &best {
                    Some((key, _)) => entry.key() < key,
                    None => true,
                };
                if better {
                    best = Some((entry.key().clone(), entry.value().clone()));
                }
            }
        }
        if let Some((key, _)) = &best {
            self.next_from = Bound::Excluded(key.clone());
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    fn config(representation: Representation) -> RepConfig {
        RepConfig {
            representation,
            vector_preallocation: 16,
            bucket_count: 4,
            prefix_len: 2,
        }
    }

    fn all_reps() -> Vec<Arc<dyn MemtableRep>> {
        [
            Representation::Vector,
            Representation::SkipList,
            Representation::HashSkipList,
        ]
        .iter()
        .map(|rep| config(*rep).build().expect("Failed to build representation"))
        .collect()
    }

    #[test]
    fn test_insert_and_get() {
        for rep in all_reps() {
            rep.insert(b"alpha".to_vec(), b"1".to_vec());
            rep.insert(b"beta".to_vec(), b"2".to_vec());

            assert_eq!(rep.get(b"alpha"), Some(b"1".to_vec()));
            assert_eq!(rep.get(b"beta"), Some(b"2".to_vec()));
            assert_eq!(rep.get(b"gamma"), None);
        }
    }

    #[test]
    fn test_newest_write_wins() {
        for rep in all_reps() {
            rep.insert(b"key".to_vec(), b"old".to_vec());
            rep.insert(b"key".to_vec(), b"new".to_vec());

            assert_eq!(rep.get(b"key"), Some(b"new".to_vec()));

            let drained = rep.sorted_entries();
            assert_eq!(drained, vec![(b"key".to_vec(), b"new".to_vec())]);
        }
    }

    #[test]
    fn test_iter_from_respects_the_lower_bound() {
        // Insertion order deliberately scrambled.
        let keys = ["delta", "alpha", "echo", "charlie", "bravo"];
        for rep in all_reps() {
            for key in keys {
                rep.insert(key.as_bytes().to_vec(), b"v".to_vec());
            }

            let yielded: Vec<Vec<u8>> = rep.iter_from(b"bravo").map(|(k, _)| k).collect();
            let expected: Vec<Vec<u8>> = ["bravo", "charlie", "delta", "echo"]
                .iter()
                .map(|k| k.as_bytes().to_vec())
                .collect();
            assert_eq!(yielded, expected);
        }
    }

    #[test]
    fn test_full_scan_is_ordered_across_hash_buckets() {
        let rep = HashSkipListRep::new(4, 2).expect("Failed to build the hash representation");
        for i in (0..100).rev() {
            rep.insert(format!("key{i:03}").into_bytes(), b"v".to_vec());
        }

        let keys: Vec<Vec<u8>> = rep.iter_from(b"").map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 100);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_hash_representation_requires_a_prefix() {
        let result = HashSkipListRep::new(16, 0);
        assert!(matches!(result, Err(Error::MissingPrefixLength)));
    }

    #[test]
    fn test_approximate_bytes_includes_entry_overhead() {
        let rep = VectorRep::new(0);
        rep.insert(vec![0u8; 8], vec![0u8; 92]);
        rep.insert(vec![1u8; 8], vec![1u8; 92]);

        assert_eq!(rep.approximate_bytes(), 2 * (100 + VECTOR_ENTRY_OVERHEAD));
    }

    #[test]
    fn test_representation_codes_round_trip() {
        assert_eq!(Representation::from_u8(1), Some(Representation::Vector));
        assert_eq!(Representation::from_u8(2), Some(Representation::SkipList));
        assert_eq!(Representation::from_u8(3), Some(Representation::HashSkipList));
        assert_eq!(Representation::from_u8(9), None);
    }

    #[test]
    fn test_unsorted_array_counts_superseded_writes() {
        let rep = VectorRep::new(0);
        rep.insert(b"key".to_vec(), b"old".to_vec());
        rep.insert(b"key".to_vec(), b"new".to_vec());

        assert_eq!(rep.len(), 2);
        assert_eq!(rep.sorted_entries().len(), 1);
    }
}
