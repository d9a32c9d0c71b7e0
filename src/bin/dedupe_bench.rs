//! dedupe-index Benchmark Driver
//!
//! Fills an index with synthetic fingerprints from one thread per zone,
//! re-posts a fraction of them, and prints statistics.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use dedupe_index::storage::MemoryStorage;
use dedupe_index::{Config, Engine, RecordData, RecordName, RequestKind};
use tracing_subscriber::{fmt, EnvFilter};

/// dedupe-index benchmark
#[derive(Parser, Debug)]
#[command(name = "dedupe-bench")]
#[command(about = "Fill a deduplication index with synthetic fingerprints")]
#[command(version)]
struct Args {
    /// Backing file; an in-memory volume is used when omitted
    #[arg(short, long)]
    data_path: Option<String>,

    /// Number of zones (one worker thread each)
    #[arg(short, long, default_value = "4")]
    zones: u32,

    /// Record pages per chapter
    #[arg(long, default_value = "16")]
    record_pages: u32,

    /// Chapters per volume
    #[arg(long, default_value = "64")]
    chapters: u32,

    /// Sparse chapters per volume
    #[arg(long, default_value = "0")]
    sparse_chapters: u32,

    /// Page reader threads (0 searches synchronously)
    #[arg(short, long, default_value = "2")]
    readers: usize,

    /// Unique fingerprints to post
    #[arg(short = 'n', long, default_value = "200000")]
    records: u64,

    /// Percent of posts that repeat an earlier fingerprint
    #[arg(long, default_value = "20")]
    duplicate_percent: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dedupe_index=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("dedupe-bench v{}", dedupe_index::VERSION);

    let mut builder = Config::builder()
        .zone_count(args.zones)
        .record_pages_per_chapter(args.record_pages)
        .chapters_per_volume(args.chapters)
        .sparse_chapters_per_volume(args.sparse_chapters)
        .read_threads(args.readers);
    if let Some(path) = &args.data_path {
        builder = builder.data_path(path);
    }
    let config = builder.build();

    let engine = match create_engine(config, args.data_path.is_some()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("Failed to create index: {}", e);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    let workers: Vec<_> = (0..args.zones)
        .map(|zone| {
            let engine = Arc::clone(&engine);
            let records = args.records;
            let duplicates = args.duplicate_percent;
            thread::spawn(move || run_zone(&engine, zone, records, duplicates))
        })
        .collect();

    let mut found = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(count)) => found += count,
            Ok(Err(e)) => tracing::error!("Zone worker failed: {}", e),
            Err(_) => tracing::error!("Zone worker panicked"),
        }
    }
    let elapsed = started.elapsed();

    let stats = engine.stats();
    println!("elapsed:            {:.2?}", elapsed);
    println!("posts:              {}", stats.posts);
    println!("duplicates found:   {}", found);
    println!("open chapter:       {}", stats.open_chapter);
    println!("volume index:       {:?}", stats.volume_index.combined());
    println!("page cache:         {:?}", stats.cache);

    if args.data_path.is_some() {
        if let Err(e) = engine.save() {
            tracing::error!("Failed to save index: {}", e);
            std::process::exit(1);
        }
    }
    engine.shutdown();
}

fn create_engine(config: Config, on_disk: bool) -> dedupe_index::Result<Engine> {
    if on_disk {
        return Engine::create(config);
    }
    let blocks = Engine::required_blocks(&config)?;
    Engine::create_with_storage(config, Arc::new(MemoryStorage::new(blocks)))
}

/// Post every fingerprint owned by `zone`; returns how many were duplicates
fn run_zone(engine: &Engine, zone: u32, records: u64, duplicate_percent: u64) -> dedupe_index::Result<u64> {
    let mut found = 0;
    let mut id = 0;
    for i in 0..records {
        // duplicate_percent of every hundred posts repeat an earlier block
        let block = if i % 100 < duplicate_percent && i > 0 { i / 2 } else { i };
        let name = RecordName::from_data(&block.to_le_bytes());
        if engine.zone_for_name(&name) != zone {
            continue;
        }
        id += 1;
        let request = engine
            .request(id, name, RequestKind::Post)
            .with_metadata(RecordData::from_u64(block));
        if engine.execute_sync(&request)?.found {
            found += 1;
        }
    }
    Ok(found)
}
