//! A compact LSM engine with a pluggable write buffer.
//!
//! Writes land in the active memtable. When it outgrows the configured
//! capacity it is frozen and handed to the flush worker, which persists it
//! as a sorted run. Once enough runs accumulate, the compaction worker
//! merges them into one. Both workers are engine-owned threads fed over
//! channels; registered [`EventListener`]s observe their progress.

use std::collections::{BinaryHeap, VecDeque};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tinyvec::TinyVec;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{
    CompactionDebt, CompactionIntrospect, CompactionJobInfo, EventListener, FlushJobInfo,
};
use crate::memtable::{Entry, MemtableRep, RepConfig};
use crate::table::{parse_run_file_name, run_file_name, SortedTable, TableCursor};

pub const DEFAULT_WRITE_BUFFER_BYTES: usize = 1 << 20;
pub const DEFAULT_COMPACTION_TRIGGER: usize = 4;

/// Configuration for [`Engine::open`].
pub struct EngineOptions {
    path: PathBuf,
    rep: RepConfig,
    write_buffer_bytes: usize,
    compaction_trigger: usize,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EngineOptions {
    pub fn new(path: impl Into<PathBuf>, rep: RepConfig) -> EngineOptions {
        EngineOptions {
            path: path.into(),
            rep,
            write_buffer_bytes: DEFAULT_WRITE_BUFFER_BYTES,
            compaction_trigger: DEFAULT_COMPACTION_TRIGGER,
            listeners: Vec::new(),
        }
    }

    /// Capacity of the active write buffer before it is frozen and flushed.
    pub fn write_buffer_bytes(mut self, bytes: usize) -> EngineOptions {
        self.write_buffer_bytes = bytes;
        self
    }

    /// Number of persisted runs that triggers a compaction.
    pub fn compaction_trigger(mut self, runs: usize) -> EngineOptions {
        self.compaction_trigger = runs.max(2);
        self
    }

    /// Registers a listener for flush and compaction events.
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> EngineOptions {
        self.listeners.push(listener);
        self
    }
}

enum FlushJob {
    Flush {
        job_id: u64,
        memtable: Arc<dyn MemtableRep>,
    },
    Shutdown,
}

enum CompactionJob {
    Compact {
        job_id: u64,
        /// Table id claimed for the merged output when the job was
        /// scheduled, so its id stays below every later flush's.
        output_id: u64,
        inputs: TinyVec<[u64; 8]>,
        input_bytes: u64,
    },
    Shutdown,
}

/// The persisted tier and the flush bookkeeping that orders it. Table ids
/// are claimed and runs installed under the same lock, which keeps id
/// order aligned with data recency.
struct TableTier {
    /// Persisted runs, oldest first.
    runs: Vec<Arc<SortedTable>>,
    /// Flushes that have claimed a table id but not yet installed their
    /// run. The compaction scheduler defers while any are outstanding.
    flushing: usize,
}

struct EngineState {
    dir: PathBuf,
    rep: RepConfig,
    compaction_trigger: usize,
    active: Mutex<Arc<dyn MemtableRep>>,
    /// Frozen write buffers awaiting flush, oldest first.
    frozen: Mutex<VecDeque<Arc<dyn MemtableRep>>>,
    tables: Mutex<TableTier>,
    next_table_id: AtomicU64,
    next_job_id: AtomicU64,
    running_compactions: AtomicU64,
    pending_compactions: AtomicU64,
    pending_compaction_bytes: AtomicU64,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EngineState {
    fn debt(&self) -> CompactionDebt {
        CompactionDebt {
            running: self.running_compactions.load(Ordering::SeqCst),
            pending: self.pending_compactions.load(Ordering::SeqCst),
            pending_bytes: self.pending_compaction_bytes.load(Ordering::SeqCst),
        }
    }
}

pub struct Engine {
    state: Arc<EngineState>,
    write_buffer_bytes: usize,
    flush_tx: Option<Sender<FlushJob>>,
    compaction_tx: Option<Sender<CompactionJob>>,
    flush_handle: Option<JoinHandle<()>>,
    compaction_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Opens the engine at `options.path`, loading any sorted runs a
    /// previous instance left behind.
    pub fn open(options: EngineOptions) -> Result<Engine> {
        fs::create_dir_all(&options.path)?;
        let runs = load_existing_runs(&options.path)?;
        let next_table_id = runs.last().map(|t| t.id() + 1).unwrap_or(0);
        let active = options.rep.build()?;

        let state = Arc::new(EngineState {
            dir: options.path,
            rep: options.rep,
            compaction_trigger: options.compaction_trigger,
            active: Mutex::new(active),
            frozen: Mutex::new(VecDeque::new()),
            tables: Mutex::new(TableTier { runs, flushing: 0 }),
            next_table_id: AtomicU64::new(next_table_id),
            next_job_id: AtomicU64::new(0),
            running_compactions: AtomicU64::new(0),
            pending_compactions: AtomicU64::new(0),
            pending_compaction_bytes: AtomicU64::new(0),
            listeners: options.listeners,
        });

        let (compaction_tx, compaction_rx) = mpsc::channel();
        let compaction_state = Arc::clone(&state);
        let reschedule_tx = compaction_tx.clone();
        let compaction_handle = thread::Builder::new()
            .name("compaction-worker".to_string())
            .spawn(move || run_compaction_worker(compaction_state, compaction_rx, reschedule_tx))?;

        let (flush_tx, flush_rx) = mpsc::channel();
        let flush_state = Arc::clone(&state);
        let flush_compaction_tx = compaction_tx.clone();
        let flush_handle = thread::Builder::new()
            .name("flush-worker".to_string())
            .spawn(move || run_flush_worker(flush_state, flush_rx, flush_compaction_tx))?;

        info!(
            path = %state.dir.display(),
            representation = %state.rep.representation,
            runs = state.tables.lock().unwrap().runs.len(),
            "Opened engine"
        );

        Ok(Engine {
            state,
            write_buffer_bytes: options.write_buffer_bytes,
            flush_tx: Some(flush_tx),
            compaction_tx: Some(compaction_tx),
            flush_handle: Some(flush_handle),
            compaction_handle: Some(compaction_handle),
        })
    }

    /// Removes the engine directory and everything in it.
    pub fn destroy(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Inserts a pair, freezing and flushing the active buffer if the write
    /// pushed it past capacity.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let active = Arc::clone(&*self.state.active.lock().unwrap());
        active.insert(key.to_vec(), value.to_vec());
        if active.approximate_bytes() >= self.write_buffer_bytes {
            self.freeze_active()?;
        }
        Ok(())
    }

    /// Point lookup across the active buffer, frozen buffers and persisted
    /// runs, newest tier first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let active = Arc::clone(&*self.state.active.lock().unwrap());
        if let Some(value) = active.get(key) {
            return Ok(Some(value));
        }

        let frozen: Vec<Arc<dyn MemtableRep>> =
            self.state.frozen.lock().unwrap().iter().cloned().collect();
        for memtable in frozen.iter().rev() {
            if let Some(value) = memtable.get(key) {
                return Ok(Some(value));
            }
        }

        let tables: Vec<Arc<SortedTable>> = self.state.tables.lock().unwrap().runs.clone();
        for table in tables.iter().rev() {
            if let Some(value) = table.get(key) {
                return Ok(Some(value.to_vec()));
            }
        }
        Ok(None)
    }

    /// Creates a merging iterator over all tiers. The iterator holds no
    /// position until [`EngineIter::seek`] is called.
    pub fn iter(&self) -> EngineIter {
        EngineIter {
            state: Arc::clone(&self.state),
            heap: BinaryHeap::new(),
            current: None,
            last_key: None,
        }
    }

    /// Approximate bytes held by the active and not-yet-flushed buffers.
    pub fn memtable_bytes(&self) -> usize {
        let active = Arc::clone(&*self.state.active.lock().unwrap());
        let mut bytes = active.approximate_bytes();
        for memtable in self.state.frozen.lock().unwrap().iter() {
            bytes += memtable.approximate_bytes();
        }
        bytes
    }

    /// Fullness advisory: true if the buffered bytes plus `reserved_bytes`
    /// of headroom would overflow the configured capacity.
    pub fn nearly_full(&self, reserved_bytes: usize) -> bool {
        self.memtable_bytes() + reserved_bytes > self.write_buffer_bytes
    }

    /// Number of persisted sorted runs.
    pub fn run_count(&self) -> usize {
        self.state.tables.lock().unwrap().runs.len()
    }

    /// Stops the background workers after they drain their queues.
    /// Dropping the engine performs the same shutdown.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn freeze_active(&self) -> Result<()> {
        let frozen = {
            let mut active = self.state.active.lock().unwrap();
            if active.is_empty() {
                return Ok(());
            }
            let fresh = self.state.rep.build()?;
            mem::replace(&mut *active, fresh)
        };
        self.state.frozen.lock().unwrap().push_back(Arc::clone(&frozen));

        let job_id = self.state.next_job_id.fetch_add(1, Ordering::SeqCst);
        self.flush_tx
            .as_ref()
            .ok_or(Error::WorkerGone("flush"))?
            .send(FlushJob::Flush {
                job_id,
                memtable: frozen,
            })
            .map_err(|_| Error::WorkerGone("flush"))?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.flush_tx.take() {
            let _ = tx.send(FlushJob::Shutdown);
        }
        if let Some(handle) = self.flush_handle.take() {
            handle.join().map_err(|_| Error::WorkerGone("flush"))?;
        }
        if let Some(tx) = self.compaction_tx.take() {
            let _ = tx.send(CompactionJob::Shutdown);
        }
        if let Some(handle) = self.compaction_handle.take() {
            handle.join().map_err(|_| Error::WorkerGone("compaction"))?;
        }
        Ok(())
    }
}

impl CompactionIntrospect for Engine {
    fn compaction_debt(&self) -> CompactionDebt {
        self.state.debt()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "Engine shutdown reported an error");
        }
    }
}

fn load_existing_runs(dir: &Path) -> Result<Vec<Arc<SortedTable>>> {
    let mut tables = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let id = match name.to_str().and_then(parse_run_file_name) {
            Some(id) => id,
            None => continue,
        };
        tables.push(Arc::new(SortedTable::load(id, entry.path())?));
    }
    tables.sort_by_key(|t| t.id());
    Ok(tables)
}

fn run_flush_worker(
    state: Arc<EngineState>,
    rx: Receiver<FlushJob>,
    compaction_tx: Sender<CompactionJob>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            FlushJob::Shutdown => break,
            FlushJob::Flush { job_id, memtable } => {
                flush_one(&state, &compaction_tx, job_id, memtable);
            }
        }
    }
}

fn flush_one(
    state: &Arc<EngineState>,
    compaction_tx: &Sender<CompactionJob>,
    job_id: u64,
    memtable: Arc<dyn MemtableRep>,
) {
    // Begin is dispatched before the buffer is drained: the begin-to-
    // completed window covers the representation's orderly extraction
    // as well as the disk write.
    let begin_info = FlushJobInfo {
        job_id,
        entries: memtable.len() as u64,
        approximate_bytes: memtable.approximate_bytes() as u64,
        ..FlushJobInfo::default()
    };
    for listener in &state.listeners {
        listener.on_flush_begin(&begin_info);
    }

    let entries = memtable.sorted_entries();
    let info = FlushJobInfo {
        entries: entries.len() as u64,
        raw_key_bytes: entries.iter().map(|(k, _)| k.len() as u64).sum(),
        raw_value_bytes: entries.iter().map(|(_, v)| v.len() as u64).sum(),
        ..begin_info
    };

    let table_id = {
        let mut tables = state.tables.lock().unwrap();
        tables.flushing += 1;
        state.next_table_id.fetch_add(1, Ordering::SeqCst)
    };
    let path = state.dir.join(run_file_name(table_id));
    let table = match SortedTable::write(table_id, path, state.rep.representation, entries) {
        Ok(table) => Arc::new(table),
        Err(err) => {
            warn!(job_id, error = %err, "Flush failed; keeping the write buffer in memory");
            state.tables.lock().unwrap().flushing -= 1;
            return;
        }
    };

    // Install the run before dropping the frozen buffer so a concurrent
    // read never sees the data in neither tier.
    {
        let mut tables = state.tables.lock().unwrap();
        tables.runs.push(Arc::clone(&table));
        tables.flushing -= 1;
    }
    {
        let mut frozen = state.frozen.lock().unwrap();
        if let Some(idx) = frozen.iter().position(|m| Arc::ptr_eq(m, &memtable)) {
            frozen.remove(idx);
        }
    }

    for listener in &state.listeners {
        listener.on_flush_completed(&info);
    }
    debug!(
        job_id,
        table_id,
        entries = info.entries,
        "Flushed the write buffer to a sorted run"
    );

    maybe_schedule_compaction(state, compaction_tx);
}

/// Schedules a compaction over every current run once the trigger is met.
/// Only one compaction is in flight at a time; whichever worker finishes
/// re-evaluates the trigger.
///
/// The merged output's table id is claimed here, under the same lock the
/// flush path claims ids under. Every run the snapshot can see has a
/// lower id than the output, and every run flushed after it a higher one,
/// so "higher id" stays equivalent to "newer data" across merges.
fn maybe_schedule_compaction(state: &Arc<EngineState>, compaction_tx: &Sender<CompactionJob>) {
    let in_flight = state.pending_compactions.load(Ordering::SeqCst)
        + state.running_compactions.load(Ordering::SeqCst);
    if in_flight > 0 {
        return;
    }

    let (inputs, input_bytes, output_id) = {
        let tables = state.tables.lock().unwrap();
        if tables.flushing > 0 {
            // A flush past its id claim holds a run this snapshot cannot
            // see; it re-evaluates the trigger once it installs.
            return;
        }
        if tables.runs.len() < state.compaction_trigger {
            return;
        }
        (
            tables
                .runs
                .iter()
                .map(|t| t.id())
                .collect::<TinyVec<[u64; 8]>>(),
            tables.runs.iter().map(|t| t.file_bytes()).sum::<u64>(),
            state.next_table_id.fetch_add(1, Ordering::SeqCst),
        )
    };

    let job_id = state.next_job_id.fetch_add(1, Ordering::SeqCst);
    state.pending_compactions.fetch_add(1, Ordering::SeqCst);
    state
        .pending_compaction_bytes
        .fetch_add(input_bytes, Ordering::SeqCst);
    if compaction_tx
        .send(CompactionJob::Compact {
            job_id,
            output_id,
            inputs,
            input_bytes,
        })
        .is_err()
    {
        // The engine is shutting down and the worker already drained.
        state.pending_compactions.fetch_sub(1, Ordering::SeqCst);
        state
            .pending_compaction_bytes
            .fetch_sub(input_bytes, Ordering::SeqCst);
    }
}

fn run_compaction_worker(
    state: Arc<EngineState>,
    rx: Receiver<CompactionJob>,
    reschedule_tx: Sender<CompactionJob>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            CompactionJob::Shutdown => break,
            CompactionJob::Compact {
                job_id,
                output_id,
                inputs,
                input_bytes,
            } => {
                compact_runs(&state, &reschedule_tx, job_id, output_id, &inputs, input_bytes);
            }
        }
    }
}

fn compact_runs(
    state: &Arc<EngineState>,
    reschedule_tx: &Sender<CompactionJob>,
    job_id: u64,
    output_id: u64,
    inputs: &[u64],
    input_bytes: u64,
) {
    state.running_compactions.fetch_add(1, Ordering::SeqCst);
    state.pending_compactions.fetch_sub(1, Ordering::SeqCst);
    state
        .pending_compaction_bytes
        .fetch_sub(input_bytes, Ordering::SeqCst);

    let input_tables: Vec<Arc<SortedTable>> = {
        let tables = state.tables.lock().unwrap();
        tables
            .runs
            .iter()
            .filter(|t| inputs.contains(&t.id()))
            .cloned()
            .collect()
    };
    if input_tables.len() < 2 {
        state.running_compactions.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    let merged_entries = merge_runs(&input_tables);
    let path = state.dir.join(run_file_name(output_id));
    let merged = match SortedTable::write(output_id, path, state.rep.representation, merged_entries)
    {
        Ok(table) => Arc::new(table),
        Err(err) => {
            warn!(job_id, error = %err, "Compaction failed; keeping the input runs");
            state.running_compactions.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    {
        let mut tables = state.tables.lock().unwrap();
        tables.runs.retain(|t| !inputs.contains(&t.id()));
        // The merged run only holds data older than any run flushed while
        // the compaction was running.
        tables.runs.insert(0, Arc::clone(&merged));
    }
    for table in &input_tables {
        if let Err(err) = fs::remove_file(table.path()) {
            warn!(
                path = %table.path().display(),
                error = %err,
                "Failed to remove a compacted run file"
            );
        }
    }

    state.running_compactions.fetch_sub(1, Ordering::SeqCst);
    maybe_schedule_compaction(state, reschedule_tx);

    let info = CompactionJobInfo {
        job_id,
        input_runs: input_tables.len(),
        output_entries: merged.len() as u64,
        debt: state.debt(),
    };
    for listener in &state.listeners {
        listener.on_compaction_completed(&info);
    }
    debug!(
        job_id,
        input_runs = info.input_runs,
        output_entries = info.output_entries,
        "Compacted sorted runs"
    );
}

/// K-way merges sorted runs into one entry list. Higher-id runs are newer;
/// their writes win duplicate keys.
fn merge_runs(inputs: &[Arc<SortedTable>]) -> Vec<Entry> {
    let mut tagged: Vec<(u64, &Entry)> = Vec::new();
    for table in inputs {
        for entry in table.entries() {
            tagged.push((table.id(), entry));
        }
    }
    tagged.sort_by(|(id_a, entry_a), (id_b, entry_b)| {
        entry_a.0.cmp(&entry_b.0).then(id_b.cmp(id_a))
    });

    let mut merged: Vec<Entry> = Vec::with_capacity(tagged.len());
    for (_, entry) in tagged {
        if merged.last().map_or(false, |last| last.0 == entry.0) {
            continue;
        }
        merged.push(entry.clone());
    }
    merged
}

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Age rank of the source tier: 0 is the active buffer, higher is older.
    source: usize,
    cursor: Box<dyn Iterator<Item = Entry> + Send>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed key order turns the max-heap into a min-heap; on equal keys
    // the lower source rank (newer tier) surfaces first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.key.cmp(&other.key) {
            std::cmp::Ordering::Equal => self.source.cmp(&other.source).reverse(),
            ordering => ordering.reverse(),
        }
    }
}

/// Merging cursor over every tier of the engine, newest-write-wins.
pub struct EngineIter {
    state: Arc<EngineState>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<Entry>,
    last_key: Option<Vec<u8>>,
}

impl EngineIter {
    /// Positions the cursor at the first key `>= start`, snapshotting the
    /// tiers as they exist right now.
    pub fn seek(&mut self, start: &[u8]) {
        let mut cursors: Vec<Box<dyn Iterator<Item = Entry> + Send>> = Vec::new();
        let active = Arc::clone(&*self.state.active.lock().unwrap());
        cursors.push(active.iter_from(start));
        {
            let frozen = self.state.frozen.lock().unwrap();
            for memtable in frozen.iter().rev() {
                cursors.push(memtable.iter_from(start));
            }
        }
        {
            let tables = self.state.tables.lock().unwrap();
            for table in tables.runs.iter().rev() {
                cursors.push(Box::new(TableCursor::new(Arc::clone(table), start)));
            }
        }

        self.heap.clear();
        for (source, mut cursor) in cursors.into_iter().enumerate() {
            if let Some((key, value)) = cursor.next() {
                self.heap.push(HeapEntry {
                    key,
                    value,
                    source,
                    cursor,
                });
            }
        }
        self.last_key = None;
        self.current = None;
        self.advance();
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Key under the cursor; empty when the cursor is not valid.
    pub fn key(&self) -> &[u8] {
        match &self.current {
            Some((key, _)) => key,
            None => &[],
        }
    }

    /// Value under the cursor; empty when the cursor is not valid.
    pub fn value(&self) -> &[u8] {
        match &self.current {
            Some((_, value)) => value,
            None => &[],
        }
    }

    pub fn next(&mut self) {
        self.advance();
    }

    fn advance(&mut self) {
        while let Some(top) = self.heap.pop() {
            let HeapEntry {
                key,
                value,
                source,
                mut cursor,
            } = top;
            if let Some((next_key, next_value)) = cursor.next() {
                self.heap.push(HeapEntry {
                    key: next_key,
                    value: next_value,
                    source,
                    cursor,
                });
            }

            // Skip older shadows of a key that was already emitted.
            if self.last_key.as_deref() == Some(key.as_slice()) {
                continue;
            }
            self.last_key = Some(key.clone());
            self.current = Some((key, value));
            return;
        }
        self.current = None;
    }
}
