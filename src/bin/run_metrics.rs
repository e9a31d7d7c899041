use chrono::{NaiveDateTime, Utc};
use clap::Parser;
use participant_metrics::{path_exists, pipeline, MemoryStore, PipelineConfig};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// Export CSV files to run the pipeline over.
    #[clap(required = true)]
    input: Vec<PathBuf>,
    /// Metrics store file, created on first run.
    #[clap(long, default_value = "metrics.bin")]
    store: PathBuf,
    /// Directory for intermediate shard files.
    #[clap(long, default_value = "metrics_work")]
    work_dir: PathBuf,
    #[clap(long, default_value_t = 4)]
    shards: usize,
    /// Override the run cutoff (e.g. 2017-01-03T00:00:00); defaults to the
    /// current UTC time.
    #[clap(long)]
    now: Option<NaiveDateTime>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let mut store = if path_exists(&opt.store)? {
        MemoryStore::load(&opt.store)?
    } else {
        MemoryStore::new()
    };

    let config = PipelineConfig {
        now: opt.now.unwrap_or_else(|| Utc::now().naive_utc()),
        shards: opt.shards,
        work_dir: opt.work_dir,
    };
    let version = pipeline::run(&config, &opt.input, &mut store)?;
    store.save(&opt.store)?;

    println!(
        "metrics version {} now serving ({} buckets stored)",
        version,
        store.bucket_count()
    );
    Ok(())
}
