//! The persistence collaborator: run-version bookkeeping and bucket storage.
//!
//! The relational layer itself is outside this crate; the pipeline only
//! needs the operations in [`MetricsStore`]. [`MemoryStore`] implements them
//! in memory and can be persisted to disk, which is what the command-line
//! tools and the tests use.

use crate::{bucket::MetricsBucket, load, save, Result};
use anyhow::bail;
use chrono::{NaiveDate, NaiveDateTime};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub type VersionId = i64;

/// One pipeline run. Buckets are tagged with their version's id so a failed
/// or in-progress run can never leak into what readers see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsVersion {
    pub id: VersionId,
    pub in_progress: bool,
    pub complete: bool,
    pub date: NaiveDateTime,
}

/// What the pipeline needs from the storage layer.
///
/// Version rows are only ever touched by the orchestrator; bucket upserts
/// come from stage-3 output with one writer per `(version, hpo, date)` key.
pub trait MetricsStore {
    /// Create a new in-progress version and return its id. Must be called
    /// exactly once per run, before any stage executes. At most one run may
    /// be active at a time; that is the caller's responsibility.
    fn start_version(&mut self, now: NaiveDateTime) -> Result<VersionId>;

    /// Mark the in-progress version finished, as either complete or failed.
    fn finish_version(&mut self, complete: bool) -> Result;

    /// Delete superseded complete versions and their buckets, keeping the
    /// latest complete one.
    fn delete_old_versions(&mut self) -> Result;

    /// Insert or overwrite the bucket for its `(version, hpo, date)` key.
    fn upsert_bucket(&mut self, bucket: MetricsBucket) -> Result;
}

/// In-memory metrics storage, loadable from and savable to a bincode file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    versions: Vec<MetricsVersion>,
    buckets: Vec<MetricsBucket>,
    next_version_id: VersionId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(self, path)
    }

    /// The latest complete version, i.e. the one read traffic serves from.
    pub fn serving_version(&self) -> Option<&MetricsVersion> {
        self.versions.iter().filter(|v| v.complete).max_by_key(|v| v.id)
    }

    pub fn version(&self, id: VersionId) -> Option<&MetricsVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    /// Buckets of the serving version, optionally filtered to one HPO
    /// (blank meaning the cross-HPO aggregate) and a date range.
    pub fn serving_buckets(
        &self,
        hpo_id: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<&MetricsBucket> {
        let Some(version) = self.serving_version() else {
            return Vec::new();
        };
        self.buckets
            .iter()
            .filter(|b| b.metrics_version_id == version.id)
            .filter(|b| hpo_id.map(|hpo| b.hpo_id == hpo).unwrap_or(true))
            .filter(|b| b.date >= start && b.date <= end)
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn in_progress_mut(&mut self) -> Option<&mut MetricsVersion> {
        self.versions.iter_mut().find(|v| v.in_progress)
    }
}

impl MetricsStore for MemoryStore {
    fn start_version(&mut self, now: NaiveDateTime) -> Result<VersionId> {
        self.next_version_id += 1;
        let id = self.next_version_id;
        self.versions.push(MetricsVersion {
            id,
            in_progress: true,
            complete: false,
            date: now,
        });
        event!(Level::INFO, "metrics version {} started", id);
        Ok(id)
    }

    fn finish_version(&mut self, complete: bool) -> Result {
        let Some(version) = self.in_progress_mut() else {
            bail!("no metrics pipeline run in progress");
        };
        version.in_progress = false;
        version.complete = complete;
        let id = version.id;
        event!(
            Level::INFO,
            "metrics version {} finished (complete: {})",
            id,
            complete
        );
        Ok(())
    }

    fn delete_old_versions(&mut self) -> Result {
        let Some(serving) = self.serving_version() else {
            return Ok(());
        };
        let keep = serving.id;
        let before = self.versions.len();
        self.versions.retain(|v| v.id >= keep);
        self.buckets.retain(|b| b.metrics_version_id >= keep);
        event!(
            Level::INFO,
            "deleted {} superseded metrics version(s)",
            before - self.versions.len()
        );
        Ok(())
    }

    fn upsert_bucket(&mut self, bucket: MetricsBucket) -> Result {
        let existing = self.buckets.iter_mut().find(|b| {
            b.metrics_version_id == bucket.metrics_version_id
                && b.hpo_id == bucket.hpo_id
                && b.date == bucket.date
        });
        match existing {
            Some(slot) => *slot = bucket,
            None => self.buckets.push(bucket),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn bucket(version: VersionId, hpo: &str, day: u32, total: i64) -> MetricsBucket {
        let mut metrics = BTreeMap::new();
        metrics.insert("Participant".to_string(), total);
        MetricsBucket {
            metrics_version_id: version,
            hpo_id: hpo.to_string(),
            date: NaiveDate::from_ymd_opt(2017, 1, day).unwrap(),
            metrics,
        }
    }

    #[test]
    fn version_lifecycle() {
        let mut store = MemoryStore::new();
        assert!(store.serving_version().is_none());
        assert!(store.finish_version(true).is_err());

        let v1 = store.start_version(now()).unwrap();
        // In-progress versions never serve.
        assert!(store.serving_version().is_none());
        store.finish_version(true).unwrap();
        assert_eq!(store.serving_version().unwrap().id, v1);

        let v2 = store.start_version(now()).unwrap();
        assert!(v2 > v1);
        // A failed run leaves the previous version serving.
        store.finish_version(false).unwrap();
        assert_eq!(store.serving_version().unwrap().id, v1);
    }

    #[test]
    fn delete_old_versions_keeps_latest_complete() {
        let mut store = MemoryStore::new();
        let v1 = store.start_version(now()).unwrap();
        store.upsert_bucket(bucket(v1, "PITT", 1, 10)).unwrap();
        store.finish_version(true).unwrap();

        let v2 = store.start_version(now()).unwrap();
        store.upsert_bucket(bucket(v2, "PITT", 1, 11)).unwrap();
        store.finish_version(true).unwrap();
        store.delete_old_versions().unwrap();

        assert!(store.version(v1).is_none());
        assert_eq!(store.serving_version().unwrap().id, v2);
        assert_eq!(store.bucket_count(), 1);
        let buckets = store.serving_buckets(
            Some("PITT"),
            NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2017, 1, 31).unwrap(),
        );
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].metrics["Participant"], 11);
    }

    #[test]
    fn upsert_overwrites_by_key() {
        let mut store = MemoryStore::new();
        let v1 = store.start_version(now()).unwrap();
        store.upsert_bucket(bucket(v1, "PITT", 1, 10)).unwrap();
        store.upsert_bucket(bucket(v1, "PITT", 1, 12)).unwrap();
        store.upsert_bucket(bucket(v1, "PITT", 2, 12)).unwrap();
        store.upsert_bucket(bucket(v1, "", 1, 30)).unwrap();
        assert_eq!(store.bucket_count(), 3);
    }

    #[test]
    fn serving_buckets_ignore_incomplete_versions() {
        let mut store = MemoryStore::new();
        let v1 = store.start_version(now()).unwrap();
        store.upsert_bucket(bucket(v1, "PITT", 1, 10)).unwrap();
        store.finish_version(true).unwrap();

        let v2 = store.start_version(now()).unwrap();
        store.upsert_bucket(bucket(v2, "PITT", 1, 99)).unwrap();
        // v2 is still in progress; readers see v1's data.
        let buckets = store.serving_buckets(
            None,
            NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2017, 1, 31).unwrap(),
        );
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].metrics["Participant"], 10);
    }
}
