//! The benchmark orchestrator.
//!
//! For each configured representation it opens a fresh engine with a gate
//! and a timing observer attached, then drives four phases: fill the write
//! buffer up to its advisory headroom, measure in-memory reads and scans,
//! overflow the buffer to time real flushes, and (for the skip-list
//! representations) measure reads and scans against the persisted tier.
//! The run ends only after the compaction gate reports a settled engine.

use std::fs::OpenOptions;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineOptions};
use crate::error::{Error, Result};
use crate::events::EventListener;
use crate::listeners::{CompactionGate, FlushObserver};
use crate::memtable::Representation;
use crate::options::BenchOptions;
use crate::report::{Aggregator, PerformanceRecord};
use crate::workload::KvPair;

/// Entries' worth of buffer capacity the fill phase leaves unused.
pub const HEADROOM_ENTRIES: usize = 10;
/// Times the array is copied and re-sorted for the sort measurement.
const RESORT_REPETITIONS: usize = 100;
/// Range scans sampled per scan measurement.
const SCAN_SAMPLES: usize = 100;
/// Point lookups sampled against the persisted tier.
const SST_POINT_LOOKUPS: usize = 1000;
/// Bounded wait for an in-flight flush to finish before the orchestrator
/// reads the observer's tables back.
const FLUSH_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_SETTLE_POLL: Duration = Duration::from_millis(5);

/// Runs every configured representation against the shared dataset. A
/// failed run logs its error and leaves a skipped slot; the remaining
/// representations still execute.
pub fn run_all(options: &BenchOptions, dataset: &[KvPair]) -> Aggregator {
    let mut aggregator = Aggregator::new();
    for &representation in &options.representations {
        info!(%representation, "Benchmarking representation");
        match run_representation(representation, options, dataset) {
            Ok(record) => aggregator.add(record),
            Err(Error::MissingPrefixLength) => {
                warn!(
                    %representation,
                    "Skipping a misconfigured representation: no key prefix length"
                );
                aggregator.add_skipped(representation);
            }
            Err(err) => {
                error!(%representation, error = %err, "Benchmark run failed");
                aggregator.add_skipped(representation);
            }
        }
    }
    aggregator
}

/// Benchmarks one representation, returning its record with the capacity
/// ratio left for the aggregator to fill in.
pub fn run_representation(
    representation: Representation,
    options: &BenchOptions,
    dataset: &[KvPair],
) -> Result<PerformanceRecord> {
    if representation == Representation::HashSkipList && options.prefix_length == 0 {
        return Err(Error::MissingPrefixLength);
    }

    let path = options.engine_path(representation);
    if options.destroy_existing {
        Engine::destroy(&path)?;
        debug!(path = %path.display(), "Destroyed the previous engine directory");
    }

    let gate = Arc::new(CompactionGate::new());
    let observer = Arc::new(FlushObserver::timing());
    let mut engine_options = EngineOptions::new(&path, options.rep_config(representation))
        .write_buffer_bytes(options.write_buffer_bytes)
        .listener(Arc::clone(&gate) as Arc<dyn EventListener>)
        .listener(Arc::clone(&observer) as Arc<dyn EventListener>);
    if let Some(log_path) = &options.flush_log_path {
        // Append: the representations of one invocation share this log.
        let sink = OpenOptions::new().create(true).append(true).open(log_path)?;
        engine_options = engine_options
            .listener(Arc::new(FlushObserver::logging(Box::new(sink))) as Arc<dyn EventListener>);
    }
    let engine = Engine::open(engine_options)?;

    let fill = run_fill_phase(&engine, dataset, options.kv_entry_size)?;
    let filled = &dataset[..fill.inserted];

    let memory = match representation {
        Representation::Vector => array_memory_metrics(filled),
        _ => engine_memory_metrics(&engine, filled)?,
    };

    let flush = run_flush_phase(&engine, &observer, &dataset[fill.inserted..])?;

    let persisted = if representation != Representation::Vector && flush.observed > 0 {
        persisted_tier_metrics(&engine, dataset, fill.inserted, options.sst_scan_selectivity)?
    } else {
        PersistedMetrics::default()
    };

    gate.wait_for_compactions(&engine);
    engine.close()?;

    Ok(PerformanceRecord {
        representation,
        insert_time_ns: fill.insert_time_ns,
        sort_time_ns: memory.sort_time_ns,
        read_time_ns: memory.read_time_ns,
        scan_time_ns: memory.scan_time_ns,
        sst_flush_time_ns: flush.average_ns,
        sst_read_time_ns: persisted.read_time_ns,
        sst_scan_time_ns: persisted.scan_time_ns,
        capacity: fill.inserted + HEADROOM_ENTRIES,
        // Fixed up by the aggregator once the array baseline is known.
        capacity_ratio: 0.0,
    })
}

struct FillOutcome {
    inserted: usize,
    insert_time_ns: f64,
}

/// Phase 1: insert until the engine advises the buffer is nearly full,
/// keeping [`HEADROOM_ENTRIES`] entries' worth of capacity unused.
fn run_fill_phase(engine: &Engine, dataset: &[KvPair], entry_bytes: usize) -> Result<FillOutcome> {
    let reserved = HEADROOM_ENTRIES * entry_bytes;
    let mut spent = Duration::ZERO;
    let mut inserted = 0;
    for pair in dataset {
        // The advisory is consulted from the second insert on, so even a
        // tiny buffer admits at least one entry.
        if inserted > 0 && engine.nearly_full(reserved) {
            break;
        }
        let start = Instant::now();
        engine.put(&pair.key, &pair.value)?;
        spent += start.elapsed();
        inserted += 1;
    }

    let insert_time_ns = if inserted == 0 {
        0.0
    } else {
        spent.as_nanos() as f64 / inserted as f64
    };
    info!(inserted, average_ns = insert_time_ns, "Fill phase complete");
    Ok(FillOutcome {
        inserted,
        insert_time_ns,
    })
}

#[derive(Default)]
struct MemoryMetrics {
    sort_time_ns: f64,
    read_time_ns: f64,
    scan_time_ns: f64,
}

/// Phase 2 for the array representation, measured against the inserted
/// prefix of the dataset: the sort cost is paid explicitly over repeated
/// copies, point reads binary-search a sorted copy, and the scan walks
/// half of it once.
fn array_memory_metrics(filled: &[KvPair]) -> MemoryMetrics {
    if filled.is_empty() {
        return MemoryMetrics::default();
    }

    let start = Instant::now();
    for _ in 0..RESORT_REPETITIONS {
        let mut copy = filled.to_vec();
        copy.sort_by(|a, b| a.key.cmp(&b.key));
        black_box(&copy);
    }
    let sort_time_ns = start.elapsed().as_nanos() as f64 / RESORT_REPETITIONS as f64;

    let mut sorted = filled.to_vec();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let start = Instant::now();
    for pair in &sorted {
        black_box(sorted.binary_search_by(|probe| probe.key.as_slice().cmp(&pair.key)));
    }
    let read_time_ns = start.elapsed().as_nanos() as f64 / sorted.len() as f64;

    let start = Instant::now();
    for pair in sorted.iter().take((sorted.len() / 2).max(1)) {
        black_box(&pair.key);
    }
    let scan_time_ns = start.elapsed().as_nanos() as f64;

    MemoryMetrics {
        sort_time_ns,
        read_time_ns,
        scan_time_ns,
    }
}

/// Phase 2 for the skip-list representations: real engine point reads over
/// a sample of the inserted keys and repeated bounded scans through the
/// engine iterator. The always-sorted structures pay no sort cost.
fn engine_memory_metrics(engine: &Engine, filled: &[KvPair]) -> Result<MemoryMetrics> {
    if filled.is_empty() {
        return Ok(MemoryMetrics::default());
    }
    let mut rng = rand::thread_rng();

    let samples = (filled.len() / 10).max(1);
    let start = Instant::now();
    for _ in 0..samples {
        let pair = &filled[rng.gen_range(0..filled.len())];
        black_box(engine.get(&pair.key)?);
    }
    let read_time_ns = start.elapsed().as_nanos() as f64 / samples as f64;

    let mut keys: Vec<&[u8]> = filled.iter().map(|pair| pair.key.as_slice()).collect();
    keys.sort_unstable();

    let mut iter = engine.iter();
    let start = Instant::now();
    for _ in 0..SCAN_SAMPLES {
        let a = rng.gen_range(0..keys.len());
        let b = rng.gen_range(0..keys.len());
        let (low, high) = if keys[a] <= keys[b] {
            (keys[a], keys[b])
        } else {
            (keys[b], keys[a])
        };
        iter.seek(low);
        while iter.valid() && iter.key() < high {
            black_box(iter.key());
            iter.next();
        }
    }
    let scan_time_ns = start.elapsed().as_nanos() as f64 / SCAN_SAMPLES as f64;

    Ok(MemoryMetrics {
        sort_time_ns: 0.0,
        read_time_ns,
        scan_time_ns,
    })
}

struct FlushOutcome {
    average_ns: f64,
    observed: usize,
}

/// Phase 3: keep inserting past the advisory so the engine freezes and
/// flushes on its own, watch for completions along the way, then read the
/// flush durations back from the observer.
fn run_flush_phase(
    engine: &Engine,
    observer: &FlushObserver,
    remainder: &[KvPair],
) -> Result<FlushOutcome> {
    let mut last_end = observer.last_flush_end();
    for pair in remainder {
        engine.put(&pair.key, &pair.value)?;
        let end = observer.last_flush_end();
        if end != last_end {
            debug!("Observed a flush completion during the overflow inserts");
            last_end = end;
        }
    }

    // A flush that started near the end of the inserts gets a bounded
    // window to finish before the tables are read back.
    let deadline = Instant::now() + FLUSH_SETTLE_TIMEOUT;
    while observer.started_jobs() > observer.flush_durations().len() && Instant::now() < deadline {
        thread::sleep(FLUSH_SETTLE_POLL);
    }

    let durations = observer.flush_durations();
    if durations.is_empty() {
        warn!("No flushes completed; reporting zero persistence latency");
        return Ok(FlushOutcome {
            average_ns: 0.0,
            observed: 0,
        });
    }
    let average_ns =
        durations.iter().map(|d| d.as_nanos() as f64).sum::<f64>() / durations.len() as f64;
    info!(
        flushes = durations.len(),
        average_ns, "Flush timing phase complete"
    );
    Ok(FlushOutcome {
        average_ns,
        observed: durations.len(),
    })
}

#[derive(Default)]
struct PersistedMetrics {
    read_time_ns: f64,
    scan_time_ns: f64,
}

/// Phase 4: point reads over keys known to be persisted (the fill-phase
/// prefix was flushed when phase 3 overflowed the buffer) and range scans
/// sized by the configured selectivity over the full sorted key space.
fn persisted_tier_metrics(
    engine: &Engine,
    dataset: &[KvPair],
    persisted: usize,
    selectivity: f64,
) -> Result<PersistedMetrics> {
    if persisted == 0 {
        return Ok(PersistedMetrics::default());
    }
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    for _ in 0..SST_POINT_LOOKUPS {
        let pair = &dataset[rng.gen_range(0..persisted)];
        black_box(engine.get(&pair.key)?);
    }
    let read_time_ns = start.elapsed().as_nanos() as f64 / SST_POINT_LOOKUPS as f64;

    let mut keys: Vec<&[u8]> = dataset.iter().map(|pair| pair.key.as_slice()).collect();
    keys.sort_unstable();
    let span = (((keys.len() as f64) * selectivity) as usize)
        .max(1)
        .min(keys.len() - 1);

    let mut iter = engine.iter();
    let start = Instant::now();
    for _ in 0..SCAN_SAMPLES {
        let origin = rng.gen_range(0..keys.len() - span);
        let low = keys[origin];
        let high = keys[origin + span];
        iter.seek(low);
        while iter.valid() && iter.key() < high {
            black_box(iter.key());
            iter.next();
        }
    }
    let scan_time_ns = start.elapsed().as_nanos() as f64 / SCAN_SAMPLES as f64;

    Ok(PersistedMetrics {
        read_time_ns,
        scan_time_ns,
    })
}
