//! Stage 3: regroup counts by HPO and date and build the persisted metrics
//! buckets.
//!
//! Each count row lands twice, once under its own HPO and once under the
//! synthetic `*` key that aggregates across all HPOs. The reducer folds the
//! rows for one `(hpo, date)` into a flat metric-path → count map which is
//! upserted as a single bucket row.

use crate::{
    event::{BucketKey, CountRow, Metric, ParticipantKind, ALL_HPOS, FULL_PARTICIPANT_KIND,
        PARTICIPANT_KIND},
    store::VersionId,
    Result,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stage-3 map: fan one count row out to its own HPO and the cross-HPO
/// aggregate.
pub fn map_count(row: CountRow) -> [(BucketKey, BucketValue); 2] {
    let value = BucketValue {
        kind: row.key.kind,
        metric: row.key.metric,
        count: row.count,
    };
    [
        (
            BucketKey {
                hpo_id: row.key.hpo_id,
                date: row.date,
            },
            value.clone(),
        ),
        (BucketKey::all_hpos(row.date), value),
    ]
}

/// One count contribution to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketValue {
    pub kind: ParticipantKind,
    pub metric: Metric,
    pub count: i64,
}

/// Stage-3 reduce: fold all contributions for one `(hpo, date)` into a
/// bucket.
///
/// The synthetic total only counts the registered tier (a full participant
/// is already included there; counting it again would double the total).
/// Every other metric files under a tier-prefixed dotted path.
pub fn reduce_bucket(key: &BucketKey, values: impl IntoIterator<Item = BucketValue>, version_id: VersionId) -> MetricsBucket {
    let mut metrics: BTreeMap<String, i64> = BTreeMap::new();
    for value in values {
        match (&value.metric, value.kind) {
            (Metric::Total, ParticipantKind::Registered) => {
                *metrics.entry(PARTICIPANT_KIND.to_string()).or_default() += value.count;
            }
            (Metric::Total, ParticipantKind::Full) => {}
            (metric, kind) => {
                let prefix = match kind {
                    ParticipantKind::Registered => PARTICIPANT_KIND,
                    ParticipantKind::Full => FULL_PARTICIPANT_KIND,
                };
                *metrics
                    .entry(format!("{}.{}", prefix, metric))
                    .or_default() += value.count;
            }
        }
    }
    MetricsBucket {
        metrics_version_id: version_id,
        hpo_id: if &*key.hpo_id == ALL_HPOS {
            String::new()
        } else {
            key.hpo_id.to_string()
        },
        date: key.date,
        metrics,
    }
}

/// One persisted row of aggregated counts: one HPO (or blank for all HPOs),
/// one date, one run version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub metrics_version_id: VersionId,
    /// Blank means the cross-HPO aggregate.
    pub hpo_id: String,
    pub date: NaiveDate,
    pub metrics: BTreeMap<String, i64>,
}

impl MetricsBucket {
    /// The metric map as the JSON blob served to readers.
    pub fn metrics_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.metrics)?)
    }

    /// Parse a serialized metric map back into key/count pairs.
    pub fn parse_metrics_json(json: &str) -> Result<BTreeMap<String, i64>> {
        Ok(serde_json::from_str(json)?)
    }
}
