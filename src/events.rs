//! Event callbacks emitted by the engine's background workers.
//!
//! Listeners are registered at engine open time and invoked on the worker
//! threads themselves, so implementations must be cheap and must not call
//! back into the engine's write path.

/// Outstanding compaction work, sampled from the engine's live counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionDebt {
    /// Compactions currently executing.
    pub running: u64,
    /// Compactions scheduled but not yet started.
    pub pending: u64,
    /// Estimated bytes the scheduled compactions still have to rewrite.
    pub pending_bytes: u64,
}

impl CompactionDebt {
    /// True when no compaction work is running or queued.
    pub fn settled(&self) -> bool {
        self.running == 0 && self.pending == 0 && self.pending_bytes == 0
    }
}

/// Live access to the engine's compaction counters.
pub trait CompactionIntrospect {
    fn compaction_debt(&self) -> CompactionDebt;
}

/// Statistics describing a single flush of the write buffer.
///
/// The begin notification carries the entry count and the buffer's
/// approximate footprint; the exact raw byte totals only exist once the
/// buffer has been drained and ride the completed notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushJobInfo {
    pub job_id: u64,
    pub entries: u64,
    /// Approximate in-memory footprint of the buffer being flushed.
    pub approximate_bytes: u64,
    pub raw_key_bytes: u64,
    pub raw_value_bytes: u64,
}

/// Statistics describing a completed compaction.
#[derive(Debug, Clone)]
pub struct CompactionJobInfo {
    pub job_id: u64,
    /// Number of sorted runs merged by this compaction.
    pub input_runs: usize,
    /// Entries in the merged output run.
    pub output_entries: u64,
    /// Compaction debt sampled right after this job finished.
    pub debt: CompactionDebt,
}

/// Hooks invoked by the engine around flush and compaction jobs. All
/// methods default to no-ops so implementations override only what they
/// observe.
pub trait EventListener: Send + Sync {
    fn on_flush_begin(&self, _info: &FlushJobInfo) {}

    fn on_flush_completed(&self, _info: &FlushJobInfo) {}

    fn on_compaction_completed(&self, _info: &CompactionJobInfo) {}
}
