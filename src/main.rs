use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use memtable_bench::memtable::Representation;
use memtable_bench::options::BenchOptions;
use memtable_bench::{bench, workload};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum RepArg {
    Vector,
    SkipList,
    HashSkipList,
}

impl From<RepArg> for Representation {
    fn from(arg: RepArg) -> Representation {
        match arg {
            RepArg::Vector => Representation::Vector,
            RepArg::SkipList => Representation::SkipList,
            RepArg::HashSkipList => Representation::HashSkipList,
        }
    }
}

impl fmt::Display for RepArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepArg::Vector => "vector",
            RepArg::SkipList => "skip-list",
            RepArg::HashSkipList => "hash-skip-list",
        };
        write!(f, "{name}")
    }
}

/// Benchmarks LSM write-buffer representations against one another.
#[derive(Debug, Parser)]
#[command(name = "memtable-bench", version, about)]
struct Cli {
    /// Representations to benchmark, in order.
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = [RepArg::Vector, RepArg::SkipList, RepArg::HashSkipList]
    )]
    representations: Vec<RepArg>,

    /// Number of key/value pairs to generate.
    #[arg(long, default_value_t = 20_000)]
    num_entries: usize,

    /// Bytes per generated pair, key plus value.
    #[arg(long, default_value_t = 100)]
    entry_size: usize,

    /// Fraction of each pair spent on the key.
    #[arg(long, default_value_t = 0.08)]
    key_size_ratio: f64,

    /// Write-buffer capacity in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    write_buffer_bytes: usize,

    /// Entry slots the array representation reserves up front.
    #[arg(long, default_value_t = 0)]
    vector_preallocation: usize,

    /// Bucket count for the hash-partitioned representation.
    #[arg(long, default_value_t = 1024)]
    bucket_count: usize,

    /// Key prefix length for hash partitioning; zero skips that
    /// representation.
    #[arg(long, default_value_t = 4)]
    prefix_length: usize,

    /// Fraction of the key space covered by each persisted-tier scan.
    #[arg(long, default_value_t = 0.01)]
    sst_scan_selectivity: f64,

    /// Keep engine directories from previous runs instead of destroying
    /// them first.
    #[arg(long)]
    keep_existing: bool,

    /// Base path for the per-representation engine directories.
    #[arg(long, default_value = "memtable-bench-data")]
    path: PathBuf,

    /// Plain-text results destination.
    #[arg(long, default_value = "results.txt")]
    results: PathBuf,

    /// Optional JSON copy of the results.
    #[arg(long)]
    json: Option<PathBuf>,

    /// Optional flush log fed by a logging observer.
    #[arg(long)]
    flush_log: Option<PathBuf>,

    /// Verbose logging (debug level unless RUST_LOG overrides it).
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_options(self) -> BenchOptions {
        BenchOptions {
            representations: self.representations.iter().map(|&arg| arg.into()).collect(),
            num_entries: self.num_entries,
            kv_entry_size: self.entry_size,
            key_size_ratio: self.key_size_ratio,
            write_buffer_bytes: self.write_buffer_bytes,
            vector_preallocation: self.vector_preallocation,
            bucket_count: self.bucket_count,
            prefix_length: self.prefix_length,
            sst_scan_selectivity: self.sst_scan_selectivity,
            destroy_existing: !self.keep_existing,
            base_path: self.path,
            results_path: self.results,
            json_results_path: self.json,
            flush_log_path: self.flush_log,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = run(cli.into_options()) {
        error!(error = %err, "Benchmark failed");
        process::exit(1);
    }
}

fn run(options: BenchOptions) -> memtable_bench::Result<()> {
    info!(
        entries = options.num_entries,
        key_bytes = options.key_len(),
        value_bytes = options.value_len(),
        "Generating the random workload"
    );
    let dataset =
        workload::generate_pairs(options.num_entries, options.key_len(), options.value_len());

    let aggregator = bench::run_all(&options, &dataset);

    for (representation, record) in aggregator.records() {
        match record {
            Some(record) => println!("{record}\n"),
            None => println!("Data Structure Type: {representation} (skipped)\n"),
        }
    }

    aggregator.write_results(&options.results_path)?;
    info!(path = %options.results_path.display(), "Results written");
    if let Some(json_path) = &options.json_results_path {
        aggregator.write_json(json_path)?;
        info!(path = %json_path.display(), "JSON results written");
    }
    Ok(())
}
