//! A benchmark harness for LSM write-buffer (memtable) representations.
//!
//! The crate pairs a compact LSM engine with pluggable write buffers (an
//! unsorted array, a skip list and a hash-partitioned skip list) with an
//! orchestrator that measures each representation through four phases:
//! buffered inserts, in-memory reads and scans, flush latency observed
//! through engine event listeners, and reads and scans against the
//! persisted tier. Results land in one [`report::PerformanceRecord`] per
//! representation.

pub mod bench;
pub mod engine;
pub mod error;
pub mod events;
pub mod listeners;
pub mod memtable;
pub mod options;
pub mod report;
pub mod table;
pub mod workload;

pub use error::{Error, Result};
