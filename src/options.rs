//! Benchmark configuration.

use std::path::PathBuf;

use crate::memtable::{RepConfig, Representation};

#[derive(Debug, Clone)]
pub struct BenchOptions {
    /// Representations to measure, in order.
    pub representations: Vec<Representation>,
    /// Number of key/value pairs generated for the workload.
    pub num_entries: usize,
    /// Total bytes of one generated pair, key plus value.
    pub kv_entry_size: usize,
    /// Fraction of a pair's bytes spent on the key.
    pub key_size_ratio: f64,
    /// Write-buffer capacity handed to the engine.
    pub write_buffer_bytes: usize,
    /// Entry slots reserved up front by the array representation.
    pub vector_preallocation: usize,
    /// Bucket count for the hash-partitioned representation.
    pub bucket_count: usize,
    /// Key prefix length hashed to route keys to buckets. Zero disables
    /// the hash-partitioned representation.
    pub prefix_length: usize,
    /// Fraction of the key space covered by each persisted-tier scan.
    pub sst_scan_selectivity: f64,
    /// Remove leftover engine directories before each run.
    pub destroy_existing: bool,
    /// Engine directories are derived from this path, one per
    /// representation.
    pub base_path: PathBuf,
    /// Plain-text results destination.
    pub results_path: PathBuf,
    /// Optional machine-readable copy of the results.
    pub json_results_path: Option<PathBuf>,
    /// Optional flush log; when set, a logging observer is registered
    /// alongside the timing one.
    pub flush_log_path: Option<PathBuf>,
}

impl Default for BenchOptions {
    fn default() -> BenchOptions {
        BenchOptions {
            representations: vec![
                Representation::Vector,
                Representation::SkipList,
                Representation::HashSkipList,
            ],
            num_entries: 20_000,
            kv_entry_size: 100,
            key_size_ratio: 0.08,
            write_buffer_bytes: 1 << 20,
            vector_preallocation: 0,
            bucket_count: 1024,
            prefix_length: 4,
            sst_scan_selectivity: 0.01,
            destroy_existing: true,
            base_path: PathBuf::from("memtable-bench-data"),
            results_path: PathBuf::from("results.txt"),
            json_results_path: None,
            flush_log_path: None,
        }
    }
}

impl BenchOptions {
    /// Key length derived from the entry size and ratio, at least one byte.
    pub fn key_len(&self) -> usize {
        (((self.kv_entry_size as f64) * self.key_size_ratio) as usize).max(1)
    }

    pub fn value_len(&self) -> usize {
        self.kv_entry_size.saturating_sub(self.key_len())
    }

    /// Engine directory for a representation, e.g. `base_vector`.
    pub fn engine_path(&self, representation: Representation) -> PathBuf {
        let mut name = self
            .base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("engine"));
        name.push('_');
        name.push_str(representation.dir_suffix());
        self.base_path.with_file_name(name)
    }

    pub fn rep_config(&self, representation: Representation) -> RepConfig {
        RepConfig {
            representation,
            vector_preallocation: self.vector_preallocation,
            bucket_count: self.bucket_count,
            prefix_len: self.prefix_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size_split() {
        let options = BenchOptions {
            kv_entry_size: 100,
            key_size_ratio: 0.08,
            ..BenchOptions::default()
        };
        assert_eq!(options.key_len(), 8);
        assert_eq!(options.value_len(), 92);
    }

    #[test]
    fn test_keys_are_never_empty() {
        let options = BenchOptions {
            kv_entry_size: 100,
            key_size_ratio: 0.001,
            ..BenchOptions::default()
        };
        assert_eq!(options.key_len(), 1);
        assert_eq!(options.value_len(), 99);
    }

    #[test]
    fn test_engine_paths_are_distinct_per_representation() {
        let options = BenchOptions {
            base_path: PathBuf::from("/tmp/bench/engine"),
            ..BenchOptions::default()
        };
        assert_eq!(
            options.engine_path(Representation::Vector),
            PathBuf::from("/tmp/bench/engine_vector")
        );
        assert_eq!(
            options.engine_path(Representation::SkipList),
            PathBuf::from("/tmp/bench/engine_skiplist")
        );
        assert_eq!(
            options.engine_path(Representation::HashSkipList),
            PathBuf::from("/tmp/bench/engine_hash_skiplist")
        );
    }
}
