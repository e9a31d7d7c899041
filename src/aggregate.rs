//! Stage 2: turn per-participant deltas into a running count per date for
//! every `(hpo, kind, metric)` key.
//!
//! The combiner collapses deltas sharing a date by integer summation; it is
//! purely a volume optimization and the reducer does not depend on it having
//! run. The reducer then walks dates forward from the first delta to the run
//! cutoff, carrying the count across days with no delta of their own.

use crate::event::{CountRow, DeltaRow, GroupKey};
use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;

/// Per-date net deltas for one group key.
pub type DeltaMap = BTreeMap<NaiveDate, i64>;

/// Stage-2 map: regroup a delta row under its `(hpo, kind, metric)` key.
pub fn map_delta(row: DeltaRow) -> (GroupKey, (NaiveDate, i64)) {
    (row.key, (row.date, row.delta))
}

/// Combine deltas for one key into a net delta per date.
pub fn combine(values: impl IntoIterator<Item = (NaiveDate, i64)>) -> DeltaMap {
    let mut map = DeltaMap::new();
    for (date, delta) in values {
        *map.entry(date).or_default() += delta;
    }
    map
}

/// Stage-2 reduce: emit one count row per day from the first delta through
/// `now` inclusive, forward-filling days without deltas.
///
/// Days where the running count is not strictly positive are skipped, not
/// emitted as zero rows; downstream treats absence as zero. Dates after
/// `now` never appear (replayed histories can contain future-dated events,
/// e.g. projected age-range transitions).
pub fn reduce_counts(key: &GroupKey, deltas: &DeltaMap, now: NaiveDate) -> Vec<CountRow> {
    let one_day = Duration::days(1);
    let mut out = Vec::new();
    let mut emit = |date: NaiveDate, count: i64| {
        if count > 0 {
            out.push(CountRow {
                key: key.clone(),
                date,
                count,
            });
        }
    };

    let mut count = 0;
    let mut last_date: Option<NaiveDate> = None;
    for (&date, &delta) in deltas {
        if date > now {
            break;
        }
        // Fill in the days between the previous delta and this one.
        if let Some(last_date) = last_date {
            let mut middle = last_date + one_day;
            while middle < date {
                emit(middle, count);
                middle += one_day;
            }
        }
        count += delta;
        emit(date, count);
        last_date = Some(date);
    }
    // Fill from the last delta through the run cutoff.
    if let Some(last_date) = last_date {
        let mut date = last_date + one_day;
        while date <= now {
            emit(date, count);
            date += one_day;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::{Metric, ParticipantKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn key() -> GroupKey {
        GroupKey::new("PITT", ParticipantKind::Registered, Metric::Total).unwrap()
    }

    fn counts(deltas: &[(NaiveDate, i64)], now: NaiveDate) -> Vec<String> {
        reduce_counts(&key(), &combine(deltas.iter().copied()), now)
            .iter()
            .map(|row| format!("{}|{}", row.date, row.count))
            .collect()
    }

    #[test]
    fn combiner_sums_per_date() {
        let map = combine(vec![
            (date(2017, 1, 1), 1),
            (date(2017, 1, 1), 1),
            (date(2017, 1, 2), -1),
            (date(2017, 1, 1), -1),
        ]);
        assert_eq!(map[&date(2017, 1, 1)], 1);
        assert_eq!(map[&date(2017, 1, 2)], -1);
    }

    #[test]
    fn forward_fill_to_now() {
        // One registration on 2017-01-01, run cutoff 2017-01-03.
        let out = counts(&[(date(2017, 1, 1), 1)], date(2017, 1, 3));
        assert_eq!(out, ["2017-01-01|1", "2017-01-02|1", "2017-01-03|1"]);
    }

    #[test]
    fn gaps_between_deltas_are_filled() {
        let out = counts(
            &[(date(2017, 1, 1), 1), (date(2017, 1, 4), 2)],
            date(2017, 1, 5),
        );
        assert_eq!(
            out,
            [
                "2017-01-01|1",
                "2017-01-02|1",
                "2017-01-03|1",
                "2017-01-04|3",
                "2017-01-05|3"
            ]
        );
    }

    #[test]
    fn zero_and_negative_counts_are_absent() {
        // +1 then -1: the value stops holding, so later days emit nothing.
        let out = counts(
            &[(date(2017, 1, 1), 1), (date(2017, 1, 3), -1)],
            date(2017, 1, 5),
        );
        assert_eq!(out, ["2017-01-01|1", "2017-01-02|1"]);
    }

    #[test]
    fn dates_after_now_are_dropped() {
        let out = counts(
            &[(date(2017, 1, 1), 1), (date(2017, 2, 1), 1)],
            date(2017, 1, 2),
        );
        assert_eq!(out, ["2017-01-01|1", "2017-01-02|1"]);
    }

    #[test]
    fn all_dates_after_now_yield_nothing() {
        let out = counts(&[(date(2017, 2, 1), 1)], date(2017, 1, 2));
        assert!(out.is_empty());
    }

    #[test]
    fn contiguous_range_property() {
        let deltas = [
            (date(2017, 1, 1), 1),
            (date(2017, 1, 5), -1),
            (date(2017, 1, 8), 1),
        ];
        let now = date(2017, 1, 10);
        let rows = reduce_counts(&key(), &combine(deltas.iter().copied()), now);
        // Every emitted date is within range and carries a positive count.
        for row in &rows {
            assert!(row.date <= now);
            assert!(row.count > 0);
        }
        // Days absent from the output are exactly the zero-count days.
        let emitted: Vec<_> = rows.iter().map(|r| r.date).collect();
        for missing in [date(2017, 1, 5), date(2017, 1, 6), date(2017, 1, 7)] {
            assert!(!emitted.contains(&missing));
        }
        assert!(emitted.contains(&date(2017, 1, 8)));
        assert!(emitted.contains(&date(2017, 1, 10)));
    }
}
