//! Benchmark-side event listeners: a gate that holds the caller until the
//! engine owes no compaction work, and an observer that either logs flushes
//! or times them.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::events::{CompactionIntrospect, CompactionJobInfo, EventListener, FlushJobInfo};

/// Upper bound on how long the gate sleeps between looks at the engine's
/// live counters, so a missed wakeup costs at most one interval.
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocks a caller until the engine's compaction debt settles.
///
/// The completion callback flips the settled flag when it observes zero
/// debt; the waiter additionally re-reads the live counters on every
/// timeout, so it never relies on catching a notification.
pub struct CompactionGate {
    settled: Mutex<bool>,
    cv: Condvar,
}

impl CompactionGate {
    pub fn new() -> CompactionGate {
        CompactionGate {
            settled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Returns once the engine reports no running or pending compactions.
    /// Returns immediately if the debt is already settled.
    pub fn wait_for_compactions<E: CompactionIntrospect>(&self, engine: &E) {
        let mut settled = self.settled.lock().unwrap();
        loop {
            if *settled {
                return;
            }
            if engine.compaction_debt().settled() {
                return;
            }
            let (guard, _timeout) = self.cv.wait_timeout(settled, GATE_POLL_INTERVAL).unwrap();
            settled = guard;
        }
    }
}

impl Default for CompactionGate {
    fn default() -> CompactionGate {
        CompactionGate::new()
    }
}

impl EventListener for CompactionGate {
    fn on_compaction_completed(&self, info: &CompactionJobInfo) {
        let mut settled = self.settled.lock().unwrap();
        if info.debt.settled() {
            *settled = true;
        }
        // Wake the waiter even with debt outstanding so it re-reads the
        // counters instead of sleeping out the full interval.
        self.cv.notify_one();
    }
}

#[derive(Default)]
struct FlushTable {
    starts: HashMap<u64, Instant>,
    ends: HashMap<u64, Instant>,
}

enum Mode {
    /// Append a line per completed flush to a sink.
    Logging(Mutex<Box<dyn Write + Send>>),
    /// Record begin/end instants per job id for later duration queries.
    Timing(Mutex<FlushTable>),
}

/// Observes flush jobs in one of two mutually exclusive modes, fixed at
/// construction: logging writes human-readable lines and keeps no state;
/// timing records per-job instants and writes nothing.
pub struct FlushObserver {
    mode: Mode,
}

impl FlushObserver {
    /// An observer that appends a line per completed flush to `sink`.
    pub fn logging(sink: Box<dyn Write + Send>) -> FlushObserver {
        FlushObserver {
            mode: Mode::Logging(Mutex::new(sink)),
        }
    }

    /// An observer that records flush begin/end times.
    pub fn timing() -> FlushObserver {
        FlushObserver {
            mode: Mode::Timing(Mutex::new(FlushTable::default())),
        }
    }

    /// Number of flush jobs seen starting. Always zero in logging mode.
    pub fn started_jobs(&self) -> usize {
        match &self.mode {
            Mode::Logging(_) => 0,
            Mode::Timing(table) => table.lock().unwrap().starts.len(),
        }
    }

    /// Durations of every flush with both a begin and an end on record.
    /// Always empty in logging mode.
    pub fn flush_durations(&self) -> Vec<Duration> {
        match &self.mode {
            Mode::Logging(_) => Vec::new(),
            Mode::Timing(table) => {
                let table = table.lock().unwrap();
                table
                    .starts
                    .iter()
                    .filter_map(|(job_id, start)| {
                        table.ends.get(job_id).map(|end| end.duration_since(*start))
                    })
                    .collect()
            }
        }
    }

    /// Completion instant of the most recently finished flush, if any.
    pub fn last_flush_end(&self) -> Option<Instant> {
        match &self.mode {
            Mode::Logging(_) => None,
            Mode::Timing(table) => table.lock().unwrap().ends.values().max().copied(),
        }
    }
}

impl EventListener for FlushObserver {
    fn on_flush_begin(&self, info: &FlushJobInfo) {
        if let Mode::Timing(table) = &self.mode {
            let mut table = table.lock().unwrap();
            // A repeated begin for the same job keeps the first timestamp.
            table.starts.entry(info.job_id).or_insert_with(Instant::now);
        }
    }

    fn on_flush_completed(&self, info: &FlushJobInfo) {
        match &self.mode {
            Mode::Logging(sink) => {
                let mut sink = sink.lock().unwrap();
                if let Err(err) = writeln!(
                    sink,
                    "flush finished [entries]: {} [raw key bytes]: {} [raw value bytes]: {}",
                    info.entries, info.raw_key_bytes, info.raw_value_bytes
                ) {
                    warn!(error = %err, "Failed to append to the flush log");
                }
            }
            Mode::Timing(table) => {
                let mut table = table.lock().unwrap();
                // An end without a matching begin is dropped rather than
                // fabricating a duration.
                if table.starts.contains_key(&info.job_id) {
                    table.ends.insert(info.job_id, Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::thread;

    use crate::events::CompactionDebt;

    use super::*;

    fn flush_info(job_id: u64) -> FlushJobInfo {
        FlushJobInfo {
            job_id,
            entries: 42,
            approximate_bytes: 4704,
            raw_key_bytes: 336,
            raw_value_bytes: 3864,
        }
    }

    fn compaction_info(debt: CompactionDebt) -> CompactionJobInfo {
        CompactionJobInfo {
            job_id: 7,
            input_runs: 4,
            output_entries: 1000,
            debt,
        }
    }

    struct StubIntrospect {
        debt: Mutex<CompactionDebt>,
    }

    impl StubIntrospect {
        fn new(debt: CompactionDebt) -> StubIntrospect {
            StubIntrospect {
                debt: Mutex::new(debt),
            }
        }

        fn set(&self, debt: CompactionDebt) {
            *self.debt.lock().unwrap() = debt;
        }
    }

    impl CompactionIntrospect for StubIntrospect {
        fn compaction_debt(&self) -> CompactionDebt {
            *self.debt.lock().unwrap()
        }
    }

    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_timing_mode_records_flush_durations() {
        let observer = FlushObserver::timing();
        observer.on_flush_begin(&flush_info(1));
        thread::sleep(Duration::from_millis(5));
        observer.on_flush_completed(&flush_info(1));

        assert_eq!(observer.started_jobs(), 1);
        let durations = observer.flush_durations();
        assert_eq!(durations.len(), 1);
        assert!(durations[0] >= Duration::from_millis(5));
        assert!(observer.last_flush_end().is_some());
    }

    #[test]
    fn test_repeated_begin_keeps_the_first_timestamp() {
        let observer = FlushObserver::timing();
        observer.on_flush_begin(&flush_info(1));
        thread::sleep(Duration::from_millis(10));
        observer.on_flush_begin(&flush_info(1));
        observer.on_flush_completed(&flush_info(1));

        let durations = observer.flush_durations();
        assert_eq!(durations.len(), 1);
        assert!(durations[0] >= Duration::from_millis(10));
    }

    #[test]
    fn test_completion_without_a_begin_is_dropped() {
        let observer = FlushObserver::timing();
        observer.on_flush_completed(&flush_info(3));

        assert_eq!(observer.started_jobs(), 0);
        assert!(observer.flush_durations().is_empty());
        assert!(observer.last_flush_end().is_none());
    }

    #[test]
    fn test_incomplete_jobs_have_no_duration() {
        let observer = FlushObserver::timing();
        observer.on_flush_begin(&flush_info(1));
        observer.on_flush_begin(&flush_info(2));
        observer.on_flush_completed(&flush_info(1));

        assert_eq!(observer.started_jobs(), 2);
        assert_eq!(observer.flush_durations().len(), 1);
    }

    #[test]
    fn test_logging_mode_writes_lines_and_keeps_no_timings() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let observer = FlushObserver::logging(Box::new(SharedSink(Arc::clone(&buffer))));

        observer.on_flush_begin(&flush_info(1));
        observer.on_flush_completed(&flush_info(1));

        let contents = String::from_utf8(buffer.lock().unwrap().clone())
            .expect("Failed to decode the flush log");
        assert!(contents.contains("flush finished [entries]: 42"));

        assert_eq!(observer.started_jobs(), 0);
        assert!(observer.flush_durations().is_empty());
        assert!(observer.last_flush_end().is_none());
    }

    #[test]
    fn test_gate_passes_immediately_when_debt_is_settled() {
        let gate = CompactionGate::new();
        let stub = StubIntrospect::new(CompactionDebt::default());

        let start = Instant::now();
        gate.wait_for_compactions(&stub);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_gate_blocks_until_the_callback_reports_zero_debt() {
        let gate = Arc::new(CompactionGate::new());
        let stub = Arc::new(StubIntrospect::new(CompactionDebt {
            running: 1,
            pending: 0,
            pending_bytes: 0,
        }));

        let gate_clone = Arc::clone(&gate);
        let stub_clone = Arc::clone(&stub);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stub_clone.set(CompactionDebt::default());
            gate_clone.on_compaction_completed(&compaction_info(CompactionDebt::default()));
        });

        let start = Instant::now();
        gate.wait_for_compactions(&*stub);
        assert!(start.elapsed() >= Duration::from_millis(40));
        handle.join().expect("Failed to join the helper thread");
    }

    #[test]
    fn test_gate_polls_past_a_missed_wakeup() {
        let gate = Arc::new(CompactionGate::new());
        let stub = Arc::new(StubIntrospect::new(CompactionDebt {
            running: 0,
            pending: 1,
            pending_bytes: 512,
        }));

        // Settle the counters without ever invoking the callback; only the
        // bounded poll can observe this.
        let stub_clone = Arc::clone(&stub);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stub_clone.set(CompactionDebt::default());
        });

        let start = Instant::now();
        gate.wait_for_compactions(&*stub);
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().expect("Failed to join the helper thread");
    }

    #[test]
    fn test_callback_with_outstanding_debt_does_not_settle_the_gate() {
        let gate = Arc::new(CompactionGate::new());
        gate.on_compaction_completed(&compaction_info(CompactionDebt {
            running: 0,
            pending: 2,
            pending_bytes: 4096,
        }));

        // Had the callback raised the flag, a waiter against nonzero live
        // debt would sail straight through instead of blocking.
        let stub = Arc::new(StubIntrospect::new(CompactionDebt {
            running: 1,
            pending: 0,
            pending_bytes: 0,
        }));
        let gate_clone = Arc::clone(&gate);
        let stub_clone = Arc::clone(&stub);
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            gate_clone.wait_for_compactions(&*stub_clone);
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        stub.set(CompactionDebt::default());
        let waited = waiter.join().expect("Failed to join the waiter");
        assert!(waited >= Duration::from_millis(40));
    }
}
