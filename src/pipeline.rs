//! The pipeline orchestrator: three map-reduces chained together, wrapped in
//! metrics-version bookkeeping.
//!
//! Stage 1 maps the export CSVs to per-participant events and reduces each
//! participant's history to count deltas. Stage 2 sums deltas per
//! `(hpo, kind, metric)` key into a running count per date. Stage 3 regroups
//! by `(hpo, date)` and writes the metrics buckets. Each stage's full output
//! is durably written before the next stage starts; shards within a stage
//! run in parallel and are pure folds over their input, so a retried shard
//! produces identical output.

use crate::{
    aggregate,
    bucket::{self, BucketValue, MetricsBucket},
    event::{BucketKey, CountRow, DeltaRow, EventPayload, GroupKey},
    mapper, state,
    store::{MetricsStore, VersionId},
    ParticipantId, Result,
};
use anyhow::{Context, Error};
use chrono::NaiveDateTime;
use qu::ick_use::*;
use rayon::prelude::*;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    fmt, fs,
    hash::{Hash, Hasher},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Run-scoped configuration. Everything a stage needs arrives as an explicit
/// argument; there is no ambient run context.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The run's cutoff timestamp. Injectable so tests and re-runs are
    /// deterministic.
    pub now: NaiveDateTime,
    /// Shard count, applied uniformly to all three stages.
    pub shards: usize,
    /// Where the intermediate stage artifacts are written.
    pub work_dir: PathBuf,
}

/// Run the full pipeline over the given export files.
///
/// Creates a new in-progress metrics version before any stage executes; on
/// success marks it complete, deletes superseded versions and removes the
/// consumed input and intermediate files. On failure the version is marked
/// incomplete and the input files are left in place for a retry.
///
/// Starting a run while another is in progress is a caller error.
pub fn run(
    config: &PipelineConfig,
    input_files: &[PathBuf],
    store: &mut impl MetricsStore,
) -> Result<VersionId> {
    ensure!(config.shards > 0, "shard count must be at least 1");
    let version_id = store.start_version(config.now)?;
    event!(
        Level::INFO,
        "starting metrics pipeline, version {}, {} input file(s), {} shard(s)",
        version_id,
        input_files.len(),
        config.shards
    );
    match run_stages(config, input_files, version_id, store) {
        Ok(artifacts) => {
            store.finish_version(true)?;
            store.delete_old_versions()?;
            remove_files(input_files.iter().chain(&artifacts))?;
            event!(Level::INFO, "metrics pipeline complete");
            Ok(version_id)
        }
        Err(error) => {
            event!(
                Level::WARN,
                "pipeline failed, marking version {} incomplete: {}",
                version_id,
                error
            );
            // The stage error is the root cause; a bookkeeping failure on
            // top of it must not replace it.
            if let Err(finish_error) = store.finish_version(false) {
                event!(
                    Level::ERROR,
                    "could not mark version {} incomplete: {}",
                    version_id,
                    finish_error
                );
            }
            Err(error)
        }
    }
}

/// The three stages in sequence. Returns the intermediate artifact paths so
/// a successful run can clean them up.
fn run_stages(
    config: &PipelineConfig,
    input_files: &[PathBuf],
    version_id: VersionId,
    store: &mut impl MetricsStore,
) -> Result<Vec<PathBuf>> {
    let delta_files = stage_deltas(config, input_files)?;
    event!(Level::INFO, "stage 1 complete: participant deltas written");
    let count_files = stage_counts(config, &delta_files)?;
    event!(Level::INFO, "stage 2 complete: date counts written");
    stage_buckets(&count_files, version_id, store)?;
    event!(Level::INFO, "stage 3 complete: buckets written");
    Ok(delta_files.into_iter().chain(count_files).collect())
}

/// Stage 1: map the export CSVs to per-participant events, group by
/// participant, and reduce each history to delta rows.
fn stage_deltas(config: &PipelineConfig, input_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<BTreeMap<ParticipantId, Vec<EventPayload>>> =
        vec![BTreeMap::new(); config.shards];
    for path in input_files {
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open input file \"{}\"", path.display()))?;
        let events = mapper::map_csv(io::BufReader::new(file))
            .with_context(|| format!("while mapping \"{}\"", path.display()))?;
        for (participant_id, payload) in events {
            let shard = shard_for(&participant_id, config.shards);
            shards[shard]
                .entry(participant_id)
                .or_insert_with(Vec::new)
                .push(payload);
        }
    }

    let now = config.now;
    let outputs: Vec<Vec<DeltaRow>> = shards
        .into_par_iter()
        .map(|groups| {
            let mut rows = Vec::new();
            for (_, events) in groups {
                rows.extend(state::reduce_participant(events, now)?);
            }
            Ok(rows)
        })
        .collect::<Result<_>>()?;
    write_artifacts(&config.work_dir, "deltas", &outputs)
}

/// Stage 2: regroup delta rows by `(hpo, kind, metric)`, combine per-date,
/// and reduce to forward-filled counts.
fn stage_counts(config: &PipelineConfig, delta_files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<BTreeMap<GroupKey, Vec<(chrono::NaiveDate, i64)>>> =
        vec![BTreeMap::new(); config.shards];
    for path in delta_files {
        for row in read_rows::<DeltaRow>(path)? {
            let (key, date_delta) = aggregate::map_delta(row);
            let shard = shard_for(&key, config.shards);
            shards[shard].entry(key).or_insert_with(Vec::new).push(date_delta);
        }
    }

    let now = config.now.date();
    let outputs: Vec<Vec<CountRow>> = shards
        .into_par_iter()
        .map(|groups| {
            let mut rows = Vec::new();
            for (key, deltas) in groups {
                let combined = aggregate::combine(deltas);
                rows.extend(aggregate::reduce_counts(&key, &combined, now));
            }
            rows
        })
        .collect();
    write_artifacts(&config.work_dir, "counts", &outputs)
}

/// Stage 3: fan counts out to per-HPO and cross-HPO keys, build one bucket
/// per `(hpo, date)`, and upsert them under the run's version.
fn stage_buckets(
    count_files: &[PathBuf],
    version_id: VersionId,
    store: &mut impl MetricsStore,
) -> Result {
    let mut groups: BTreeMap<BucketKey, Vec<BucketValue>> = BTreeMap::new();
    for path in count_files {
        for row in read_rows::<CountRow>(path)? {
            for (key, value) in bucket::map_count(row) {
                groups.entry(key).or_insert_with(Vec::new).push(value);
            }
        }
    }

    // Reducer keys are disjoint, so the buckets can be built in parallel;
    // the store itself sees one writer.
    let buckets: Vec<MetricsBucket> = groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(key, values)| bucket::reduce_bucket(&key, values, version_id))
        .collect();
    for bucket in buckets {
        store.upsert_bucket(bucket)?;
    }
    Ok(())
}

fn shard_for<T: Hash>(value: &T, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Write one artifact file per shard. The files are flushed before the
/// function returns, which is the barrier between stages.
fn write_artifacts<T: fmt::Display>(
    work_dir: &Path,
    stage: &str,
    shard_outputs: &[Vec<T>],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(work_dir)
        .with_context(|| format!("could not create work dir \"{}\"", work_dir.display()))?;
    let mut paths = Vec::with_capacity(shard_outputs.len());
    for (shard, rows) in shard_outputs.iter().enumerate() {
        let path = work_dir.join(format!("{}_{}.txt", stage, shard));
        let mut out = io::BufWriter::new(
            fs::File::create(&path)
                .with_context(|| format!("unable to create \"{}\"", path.display()))?,
        );
        for row in rows {
            writeln!(out, "{}", row)?;
        }
        out.flush()?;
        paths.push(path);
    }
    Ok(paths)
}

fn read_rows<T>(path: &Path) -> Result<Vec<T>>
where
    T: FromStr<Err = Error>,
{
    let file = fs::File::open(path)
        .with_context(|| format!("unable to open \"{}\"", path.display()))?;
    io::BufReader::new(file)
        .lines()
        .map(|line| line?.parse())
        .collect::<Result<Vec<T>>>()
        .with_context(|| format!("while reading \"{}\"", path.display()))
}

fn remove_files<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Result {
    for path in paths {
        fs::remove_file(path)
            .with_context(|| format!("unable to delete \"{}\"", path.display()))?;
        event!(Level::INFO, "deleted consumed file \"{}\"", path.display());
    }
    Ok(())
}
