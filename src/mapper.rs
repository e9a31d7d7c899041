//! Stage-1 map: turn one export CSV file into a stream of per-participant
//! event tuples.
//!
//! The export job writes three row shapes (participant facts, HPO assignment
//! history, questionnaire answer history). Which one a file holds is decided
//! once per file by exact header-row equality; anything else is a fatal
//! error for the shard.

use crate::{
    config::{
        census_region, question_field, resolve_race, FieldType, MODULE_COLUMNS,
        BIOSPECIMEN_METRIC, BIOSPECIMEN_SAMPLES_METRIC, CENSUS_REGION_METRIC, COMPLETED_VALUE,
        HPO_ID_METRIC, PHYSICAL_MEASUREMENTS_METRIC, RACE_METRIC, RACE_QUESTION_CODE,
        RECEIVED_VALUE, SAMPLES_ARRIVED_VALUE, SAMPLES_TO_ISOLATE_DNA_METRIC,
        SPECIMEN_COLLECTED_VALUE, STATE_METRIC, SUBMITTED_VALUE,
    },
    event::{parse_datetime, EventPayload, Metric},
    ArcStr, ParticipantId, Result,
};
use anyhow::{bail, ensure, format_err, Context};
use chrono::NaiveDate;
use std::io;

pub const HPO_ID_FIELDS: &[&str] = &["participant_id", "hpo", "last_modified"];
pub const ANSWER_FIELDS: &[&str] = &[
    "participant_id",
    "start_time",
    "question_code",
    "answer_code",
    "answer_string",
];

const PARTICIPANT_BASE_FIELDS: &[&str] = &[
    "participant_id",
    "date_of_birth",
    "first_order_date",
    "first_samples_arrived_date",
    "first_physical_measurements_date",
    "first_samples_to_isolate_dna_date",
];

/// Header row of the participant-facts export: the base fields followed by
/// one submission-time column per questionnaire module.
pub fn participant_fields() -> Vec<&'static str> {
    let mut fields = PARTICIPANT_BASE_FIELDS.to_vec();
    fields.extend(MODULE_COLUMNS.iter().map(|(column, _)| *column));
    fields
}

/// Which of the three export row shapes a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvSchema {
    ParticipantFacts,
    HpoHistory,
    AnswerHistory,
}

impl CsvSchema {
    /// Decide the schema from the header row. Unrecognized headers are a
    /// fatal error.
    pub fn detect(headers: &csv::StringRecord) -> Result<Self> {
        let headers: Vec<&str> = headers.iter().collect();
        if headers == HPO_ID_FIELDS {
            Ok(CsvSchema::HpoHistory)
        } else if headers == ANSWER_FIELDS {
            Ok(CsvSchema::AnswerHistory)
        } else if headers == participant_fields() {
            Ok(CsvSchema::ParticipantFacts)
        } else {
            bail!("unrecognized CSV headers: {:?}", headers)
        }
    }
}

/// Map one export CSV file to `(participant, event)` tuples.
pub fn map_csv(input: impl io::Read) -> Result<Vec<(ParticipantId, EventPayload)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let schema = CsvSchema::detect(reader.headers().context("no header row")?)?;
    match schema {
        CsvSchema::HpoHistory => map_hpo_ids(&mut reader),
        CsvSchema::AnswerHistory => map_answers(&mut reader),
        CsvSchema::ParticipantFacts => map_participants(&mut reader),
    }
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize, name: &str) -> Result<&'r str> {
    record
        .get(idx)
        .ok_or_else(|| format_err!("row is missing its \"{}\" column", name))
}

/// One event per HPO assignment: `(participant, time|hpoId.<hpo>)`.
///
/// The first one chronologically is the HPO the participant signed up under
/// and seeds the participant's initial state.
fn map_hpo_ids(reader: &mut csv::Reader<impl io::Read>) -> Result<Vec<(ParticipantId, EventPayload)>> {
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let participant_id: ArcStr = field(&record, 0, "participant_id")?.into();
        ensure!(!participant_id.is_empty(), "empty participant id");
        let hpo = field(&record, 1, "hpo")?;
        let time = parse_datetime(field(&record, 2, "last_modified")?)?;
        out.push((
            participant_id,
            EventPayload::metric(time, Metric::field(HPO_ID_METRIC, hpo)?),
        ));
    }
    Ok(out)
}

/// One event per questionnaire answer.
///
/// Precondition: rows arrive sorted by participant id, start time and
/// question code (the export job guarantees this). Consecutive race answers
/// for one participant/time are buffered and combined into a single race
/// value; out-of-order input would silently split those groups.
fn map_answers(reader: &mut csv::Reader<impl io::Read>) -> Result<Vec<(ParticipantId, EventPayload)>> {
    let mut out = Vec::new();
    let mut last: Option<(ArcStr, ArcStr)> = None;
    let mut race_codes: Vec<ArcStr> = Vec::new();

    let flush_race = |last: &Option<(ArcStr, ArcStr)>,
                          race_codes: &mut Vec<ArcStr>,
                          out: &mut Vec<(ParticipantId, EventPayload)>|
     -> Result {
        let (participant_id, start_time) = last
            .clone()
            .expect("race answers buffered without a current row");
        let race = resolve_race(race_codes.iter().map(|code| &**code));
        out.push((
            participant_id,
            EventPayload::metric(
                parse_datetime(&start_time)?,
                Metric::field(RACE_METRIC, race)?,
            ),
        ));
        race_codes.clear();
        Ok(())
    };

    for record in reader.records() {
        let record = record?;
        let participant_id: ArcStr = field(&record, 0, "participant_id")?.into();
        ensure!(!participant_id.is_empty(), "empty participant id");
        let start_time: ArcStr = field(&record, 1, "start_time")?.into();
        let question_code = field(&record, 2, "question_code")?;
        let answer_code = field(&record, 3, "answer_code")?;
        let answer_string = field(&record, 4, "answer_string")?;

        if !race_codes.is_empty() {
            let (last_id, last_time) = last.as_ref().unwrap();
            if *last_id != participant_id
                || *last_time != start_time
                || question_code != RACE_QUESTION_CODE
            {
                flush_race(&last, &mut race_codes, &mut out)?;
            }
        }
        last = Some((participant_id.clone(), start_time.clone()));

        if question_code == RACE_QUESTION_CODE {
            race_codes.push(answer_code.into());
            continue;
        }

        let (metric_name, field_type) = question_field(question_code)
            .ok_or_else(|| format_err!("unsupported question code \"{}\"", question_code))?;
        let time = parse_datetime(&start_time)?;
        let answer_value = match field_type {
            FieldType::Code => answer_code,
            FieldType::String => answer_string,
        };
        if metric_name == STATE_METRIC {
            // State answer codes end in the two-letter postal code, which
            // also locates the participant's census region. Suffixing by
            // chars keeps a malformed multibyte code a per-row lookup miss
            // rather than a panic.
            let postal = answer_code
                .char_indices()
                .rev()
                .nth(1)
                .map(|(idx, _)| &answer_code[idx..])
                .unwrap_or(answer_code);
            out.push((
                participant_id.clone(),
                EventPayload::metric(
                    time,
                    Metric::field(CENSUS_REGION_METRIC, census_region(postal))?,
                ),
            ));
        }
        out.push((
            participant_id,
            EventPayload::metric(time, Metric::field(metric_name, answer_value)?),
        ));
    }

    // A race group still open at end of input flushes here.
    if !race_codes.is_empty() {
        flush_race(&last, &mut race_codes, &mut out)?;
    }
    Ok(out)
}

/// Up to one event per non-empty participant-facts column: the date of birth
/// pseudo-event, the four first-occurrence milestones, and one submission
/// event per questionnaire module, resolved positionally.
fn map_participants(
    reader: &mut csv::Reader<impl io::Read>,
) -> Result<Vec<(ParticipantId, EventPayload)>> {
    const MILESTONES: &[(usize, &str, &str)] = &[
        (2, BIOSPECIMEN_METRIC, SPECIMEN_COLLECTED_VALUE),
        (3, BIOSPECIMEN_SAMPLES_METRIC, SAMPLES_ARRIVED_VALUE),
        (4, PHYSICAL_MEASUREMENTS_METRIC, COMPLETED_VALUE),
        (5, SAMPLES_TO_ISOLATE_DNA_METRIC, RECEIVED_VALUE),
    ];

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let participant_id: ArcStr = field(&record, 0, "participant_id")?.into();
        ensure!(!participant_id.is_empty(), "empty participant id");
        let value = |idx: usize| record.get(idx).filter(|v| !v.is_empty());

        if let Some(dob) = value(1) {
            let date = NaiveDate::parse_from_str(dob, "%Y-%m-%d")
                .with_context(|| format!("unparseable date of birth \"{}\"", dob))?;
            out.push((participant_id.clone(), EventPayload::DateOfBirth(date)));
        }
        for (idx, metric_name, metric_value) in MILESTONES {
            if let Some(time) = value(*idx) {
                out.push((
                    participant_id.clone(),
                    EventPayload::metric(
                        parse_datetime(time)?,
                        Metric::field(*metric_name, *metric_value)?,
                    ),
                ));
            }
        }
        for (i, (_, module)) in MODULE_COLUMNS.iter().enumerate() {
            if let Some(time) = value(PARTICIPANT_BASE_FIELDS.len() + i) {
                out.push((
                    participant_id.clone(),
                    EventPayload::metric(
                        parse_datetime(time)?,
                        Metric::field(*module, SUBMITTED_VALUE)?,
                    ),
                ));
            }
        }
    }
    Ok(out)
}
