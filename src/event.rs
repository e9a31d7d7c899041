//! The flat string tuples passed between pipeline stages.
//!
//! Stage outputs are durably written as pipe-delimited lines; `|` separates
//! fields and `.` separates a metric name from its value. Both delimiters are
//! reserved and rejected when they appear inside field content. The types
//! here keep the structure explicit in memory and only flatten to strings at
//! the stage boundary.

use crate::{ArcStr, Result};
use anyhow::{bail, ensure, format_err, Context, Error};
use chrono::{NaiveDate, NaiveDateTime};
use std::{fmt, str::FromStr};

pub const UNSET: &str = "UNSET";

/// Metric key for the synthetic per-participant total.
pub const PARTICIPANT_KIND: &str = "Participant";
pub const FULL_PARTICIPANT_KIND: &str = "FullParticipant";

const DATE_OF_BIRTH_PREFIX: &str = "DOB";
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a timestamp as written by the export job.
///
/// Most columns carry full datetimes, but some (notably dates of birth and
/// a few first-event columns) are bare dates; those parse as midnight.
pub fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT) {
        return Ok(dt);
    }
    let date = NaiveDate::parse_from_str(s, DATE_FORMAT)
        .with_context(|| format!("unparseable timestamp \"{}\"", s))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap())
}

fn check_field(what: &str, s: &str) -> Result {
    ensure!(
        !s.contains('|'),
        "{} \"{}\" contains the reserved delimiter '|'",
        what,
        s
    );
    Ok(())
}

/// A metric name/value pair, e.g. `race.WHITE`.
///
/// The synthetic total has no value and encodes as the bare `Participant`
/// kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Total,
    Field { name: ArcStr, value: ArcStr },
}

impl Metric {
    pub fn field(name: impl Into<ArcStr>, value: impl Into<ArcStr>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        check_field("metric name", &name)?;
        ensure!(
            !name.contains('.'),
            "metric name \"{}\" contains the reserved delimiter '.'",
            name
        );
        check_field("metric value", &value)?;
        Ok(Metric::Field { name, value })
    }

    pub fn name(&self) -> &str {
        match self {
            Metric::Total => PARTICIPANT_KIND,
            Metric::Field { name, .. } => name,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            // The total counts 1 per participant; the value never changes.
            Metric::Total => "1",
            Metric::Field { value, .. } => value,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Metric::Total => f.write_str(PARTICIPANT_KIND),
            Metric::Field { name, value } => write!(f, "{}.{}", name, value),
        }
    }
}

impl FromStr for Metric {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if s == PARTICIPANT_KIND {
            return Ok(Metric::Total);
        }
        let (name, value) = s
            .split_once('.')
            .ok_or_else(|| format_err!("metric \"{}\" has no value part", s))?;
        Metric::field(name, value)
    }
}

/// One stage-1 map output value for a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Pseudo-event carrying the participant's date of birth; used only to
    /// seed age-range derivation, never emitted as a metric.
    DateOfBirth(NaiveDate),
    Metric {
        time: NaiveDateTime,
        metric: Metric,
    },
}

impl EventPayload {
    pub fn metric(time: NaiveDateTime, metric: Metric) -> Self {
        EventPayload::Metric { time, metric }
    }
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventPayload::DateOfBirth(date) => {
                write!(f, "{}|{}", DATE_OF_BIRTH_PREFIX, date.format(DATE_FORMAT))
            }
            EventPayload::Metric { time, metric } => {
                write!(f, "{}|{}", time.format(DATETIME_FORMAT), metric)
            }
        }
    }
}

impl FromStr for EventPayload {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (prefix, rest) = s
            .split_once('|')
            .ok_or_else(|| format_err!("malformed event tuple \"{}\"", s))?;
        if prefix == DATE_OF_BIRTH_PREFIX {
            let date = NaiveDate::parse_from_str(rest, DATE_FORMAT)
                .with_context(|| format!("unparseable date of birth \"{}\"", rest))?;
            Ok(EventPayload::DateOfBirth(date))
        } else {
            Ok(EventPayload::Metric {
                time: parse_datetime(prefix)?,
                metric: rest.parse()?,
            })
        }
    }
}

/// The two enrollment tiers a delta can be counted under.
///
/// Every participant with any history is `Registered`; `Full` additionally
/// holds from the date enrollment status first reaches full participant, and
/// is never revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticipantKind {
    Registered,
    Full,
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParticipantKind::Registered => f.write_str("R"),
            ParticipantKind::Full => f.write_str("F"),
        }
    }
}

impl FromStr for ParticipantKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "R" => Ok(ParticipantKind::Registered),
            "F" => Ok(ParticipantKind::Full),
            _ => bail!("unknown participant kind \"{}\"", s),
        }
    }
}

/// Stage-2 grouping key: every delta for one HPO, enrollment tier and metric
/// value reduces together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub hpo_id: ArcStr,
    pub kind: ParticipantKind,
    pub metric: Metric,
}

impl GroupKey {
    pub fn new(hpo_id: impl Into<ArcStr>, kind: ParticipantKind, metric: Metric) -> Result<Self> {
        let hpo_id = hpo_id.into();
        check_field("HPO id", &hpo_id)?;
        Ok(GroupKey {
            hpo_id,
            kind,
            metric,
        })
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}|{}", self.hpo_id, self.kind, self.metric)
    }
}

/// A signed unit change of one metric count, as emitted by the participant
/// state reducer: `hpoId|kind|metric.value|date|±1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRow {
    pub key: GroupKey,
    pub date: NaiveDate,
    pub delta: i64,
}

impl fmt::Display for DeltaRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}|{}", self.key, self.date.format(DATE_FORMAT), self.delta)
    }
}

impl FromStr for DeltaRow {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (key, date, delta) = parse_row(s)?;
        Ok(DeltaRow { key, date, delta })
    }
}

/// A running count of one metric for one date, as emitted by the stage-2
/// reducer: `hpoId|kind|metric.value|date|count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRow {
    pub key: GroupKey,
    pub date: NaiveDate,
    pub count: i64,
}

impl fmt::Display for CountRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}|{}", self.key, self.date.format(DATE_FORMAT), self.count)
    }
}

impl FromStr for CountRow {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (key, date, count) = parse_row(s)?;
        Ok(CountRow { key, date, count })
    }
}

fn parse_row(s: &str) -> Result<(GroupKey, NaiveDate, i64)> {
    let mut parts = s.split('|');
    let mut next = |what: &str| {
        parts
            .next()
            .ok_or_else(|| format_err!("row \"{}\" is missing its {} field", s, what))
    };
    let hpo_id = next("HPO id")?;
    let kind: ParticipantKind = next("participant kind")?.parse()?;
    let metric: Metric = next("metric")?.parse()?;
    let date = NaiveDate::parse_from_str(next("date")?, DATE_FORMAT)?;
    let num: i64 = next("count")?
        .parse()
        .with_context(|| format!("bad count in row \"{}\"", s))?;
    ensure!(
        parts.next().is_none(),
        "row \"{}\" has too many fields",
        s
    );
    Ok((GroupKey::new(hpo_id, kind, metric)?, date, num))
}

/// Stage-3 grouping key: one persisted bucket per HPO (or `*` for all HPOs)
/// per date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    /// `*` means the cross-HPO aggregate.
    pub hpo_id: ArcStr,
    pub date: NaiveDate,
}

pub const ALL_HPOS: &str = "*";

impl BucketKey {
    pub fn all_hpos(date: NaiveDate) -> Self {
        BucketKey {
            hpo_id: ALL_HPOS.into(),
            date,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}", self.hpo_id, self.date.format(DATE_FORMAT))
    }
}
