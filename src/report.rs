//! Performance records, aggregation and results output.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::memtable::Representation;

/// Measurements for one representation. Times are in nanoseconds:
/// per-operation averages, except the in-memory array scan which reports a
/// single half-traversal total.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    pub representation: Representation,
    /// Average time to insert one pair during the fill phase.
    pub insert_time_ns: f64,
    /// Average time to copy and re-sort the array; zero for the
    /// always-sorted representations.
    pub sort_time_ns: f64,
    /// Average in-memory point-read time.
    pub read_time_ns: f64,
    /// In-memory range-scan time.
    pub scan_time_ns: f64,
    /// Average write-buffer flush duration.
    pub sst_flush_time_ns: f64,
    /// Average persisted-tier point-read time.
    pub sst_read_time_ns: f64,
    /// Average persisted-tier range-scan time.
    pub sst_scan_time_ns: f64,
    /// Entries the write buffer admitted before the fullness advisory
    /// tripped, plus the reserved headroom.
    pub capacity: usize,
    /// This representation's capacity relative to the array baseline.
    pub capacity_ratio: f64,
}

impl fmt::Display for PerformanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data Structure Type: {}", self.representation)?;
        writeln!(f, "InsertTime: {:.6}", self.insert_time_ns)?;
        writeln!(f, "SortTime: {:.6}", self.sort_time_ns)?;
        writeln!(f, "ReadTime: {:.6}", self.read_time_ns)?;
        writeln!(f, "ScanTime: {:.6}", self.scan_time_ns)?;
        writeln!(f, "SstFlushTime: {:.6}", self.sst_flush_time_ns)?;
        writeln!(f, "SstReadTime: {:.6}", self.sst_read_time_ns)?;
        writeln!(f, "SstScanTime: {:.6}", self.sst_scan_time_ns)?;
        write!(f, "CapacityRatio: {:.6}", self.capacity_ratio)
    }
}

/// Collects one record slot per requested representation and derives each
/// record's capacity ratio against the array representation's capacity.
#[derive(Default)]
pub struct Aggregator {
    slots: Vec<(Representation, Option<PerformanceRecord>)>,
    vector_capacity: Option<usize>,
}

impl Aggregator {
    pub fn new() -> Aggregator {
        Aggregator::default()
    }

    /// Admits a completed record, fixing up its capacity ratio. The array
    /// representation is its own baseline with a ratio of exactly one.
    pub fn add(&mut self, mut record: PerformanceRecord) {
        record.capacity_ratio = match record.representation {
            Representation::Vector => {
                self.vector_capacity = Some(record.capacity);
                1.0
            }
            _ => match self.vector_capacity {
                Some(baseline) if baseline > 0 => record.capacity as f64 / baseline as f64,
                _ => {
                    warn!(
                        representation = %record.representation,
                        "No array capacity baseline on record; reporting a zero ratio"
                    );
                    0.0
                }
            },
        };
        self.slots.push((record.representation, Some(record)));
    }

    /// Reserves a slot for a representation that was skipped.
    pub fn add_skipped(&mut self, representation: Representation) {
        self.slots.push((representation, None));
    }

    pub fn records(&self) -> &[(Representation, Option<PerformanceRecord>)] {
        &self.slots
    }

    /// Writes the plain-text results file: one header line per slot, each
    /// populated slot followed by its eight values, one per line. Skipped
    /// slots carry only their header.
    pub fn write_results(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for (representation, record) in &self.slots {
            match record {
                Some(record) => {
                    writeln!(writer, "# {}", representation.dir_suffix())?;
                    writeln!(writer, "{:.6}", record.insert_time_ns)?;
                    writeln!(writer, "{:.6}", record.sort_time_ns)?;
                    writeln!(writer, "{:.6}", record.read_time_ns)?;
                    writeln!(writer, "{:.6}", record.scan_time_ns)?;
                    writeln!(writer, "{:.6}", record.sst_flush_time_ns)?;
                    writeln!(writer, "{:.6}", record.sst_read_time_ns)?;
                    writeln!(writer, "{:.6}", record.sst_scan_time_ns)?;
                    writeln!(writer, "{:.6}", record.capacity_ratio)?;
                }
                None => {
                    writeln!(writer, "# {} skipped", representation.dir_suffix())?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Serializes every slot to `path` as JSON, skipped slots as nulls.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Slot<'a> {
            representation: Representation,
            record: Option<&'a PerformanceRecord>,
        }

        let slots: Vec<Slot> = self
            .slots
            .iter()
            .map(|(representation, record)| Slot {
                representation: *representation,
                record: record.as_ref(),
            })
            .collect();
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &slots)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn sample_record(representation: Representation, capacity: usize) -> PerformanceRecord {
        PerformanceRecord {
            representation,
            insert_time_ns: 120.5,
            sort_time_ns: 0.0,
            read_time_ns: 310.25,
            scan_time_ns: 5000.0,
            sst_flush_time_ns: 2_000_000.0,
            sst_read_time_ns: 890.0,
            sst_scan_time_ns: 40_000.0,
            capacity,
            capacity_ratio: 0.0,
        }
    }

    #[test]
    fn test_array_record_is_its_own_baseline() {
        let mut aggregator = Aggregator::new();
        aggregator.add(sample_record(Representation::Vector, 500));
        aggregator.add(sample_record(Representation::SkipList, 400));

        let slots = aggregator.records();
        let vector = slots[0].1.as_ref().expect("Missing the array record");
        let skiplist = slots[1].1.as_ref().expect("Missing the skip-list record");
        assert_eq!(vector.capacity_ratio, 1.0);
        assert!((skiplist.capacity_ratio - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_without_a_baseline_is_zero() {
        let mut aggregator = Aggregator::new();
        aggregator.add(sample_record(Representation::SkipList, 400));

        let record = aggregator.records()[0]
            .1
            .as_ref()
            .expect("Missing the record");
        assert_eq!(record.capacity_ratio, 0.0);
    }

    #[test]
    fn test_results_file_layout() {
        let dir = tempdir().expect("Failed to create the temp dir");
        let path = dir.path().join("results.txt");

        let mut aggregator = Aggregator::new();
        aggregator.add(sample_record(Representation::Vector, 500));
        aggregator.add_skipped(Representation::HashSkipList);
        aggregator
            .write_results(&path)
            .expect("Failed to write the results");

        let contents = fs::read_to_string(&path).expect("Failed to read the results");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "# vector");
        for line in &lines[1..9] {
            line.parse::<f64>().expect("Expected a numeric line");
        }
        assert_eq!(lines[9], "# hash_skiplist skipped");
    }

    #[test]
    fn test_json_results_mark_skipped_slots_as_null() {
        let dir = tempdir().expect("Failed to create the temp dir");
        let path = dir.path().join("results.json");

        let mut aggregator = Aggregator::new();
        aggregator.add(sample_record(Representation::Vector, 500));
        aggregator.add_skipped(Representation::SkipList);
        aggregator
            .write_json(&path)
            .expect("Failed to write the JSON results");

        let contents = fs::read_to_string(&path).expect("Failed to read the JSON results");
        let parsed: serde_json::Value =
            serde_json::from_str(&contents).expect("Failed to parse the JSON results");
        let slots = parsed.as_array().expect("Expected a JSON array");
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0]["representation"], "vector");
        assert_eq!(slots[0]["record"]["capacity"], 500);
        assert_eq!(slots[1]["representation"], "skip_list");
        assert!(slots[1]["record"].is_null());
    }
}
