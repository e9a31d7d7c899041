//! The metrics configuration: which participant fields are tracked, how
//! questionnaire answers map onto them, and how derived fields are computed.
//!
//! In addition to the fields listed here, a synthetic total is tracked for
//! every participant so that overall participant counts appear in the output
//! alongside per-field breakdowns.

use crate::{event::UNSET, ArcStr};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

pub const HPO_ID_METRIC: &str = "hpoId";
pub const AGE_RANGE_METRIC: &str = "ageRange";
pub const CENSUS_REGION_METRIC: &str = "censusRegion";
pub const RACE_METRIC: &str = "race";
pub const STATE_METRIC: &str = "state";
pub const GENDER_IDENTITY_METRIC: &str = "genderIdentity";
pub const ENROLLMENT_STATUS_METRIC: &str = "enrollmentStatus";
pub const BIOSPECIMEN_METRIC: &str = "biospecimen";
pub const BIOSPECIMEN_SAMPLES_METRIC: &str = "biospecimenSamples";
pub const PHYSICAL_MEASUREMENTS_METRIC: &str = "physicalMeasurements";
pub const SAMPLES_TO_ISOLATE_DNA_METRIC: &str = "samplesToIsolateDNA";
pub const NUM_BASELINE_MODULES_METRIC: &str = "numCompletedBaselinePPIModules";

pub const SPECIMEN_COLLECTED_VALUE: &str = "SPECIMEN_COLLECTED";
pub const SAMPLES_ARRIVED_VALUE: &str = "SAMPLES_ARRIVED";
pub const COMPLETED_VALUE: &str = "COMPLETED";
pub const RECEIVED_VALUE: &str = "RECEIVED";
pub const SUBMITTED_VALUE: &str = "SUBMITTED";

pub const INTERESTED_VALUE: &str = "INTERESTED";
pub const MEMBER_VALUE: &str = "MEMBER";
pub const FULL_PARTICIPANT_VALUE: &str = "FULL_PARTICIPANT";

pub const RACE_QUESTION_CODE: &str = "Race_WhatRaceEthnicity";

/// Questionnaire module submission columns in the participant-facts export,
/// in column order, paired with the metric each resolves to.
pub const MODULE_COLUMNS: &[(&str, &str)] = &[
    (
        "consent_for_study_enrollment_time",
        "consentForStudyEnrollment",
    ),
    (
        "consent_for_electronic_health_records_time",
        "consentForElectronicHealthRecords",
    ),
    ("questionnaire_on_the_basics_time", "questionnaireOnTheBasics"),
    (
        "questionnaire_on_overall_health_time",
        "questionnaireOnOverallHealth",
    ),
    ("questionnaire_on_lifestyle_time", "questionnaireOnLifestyle"),
    (
        "questionnaire_on_healthcare_access_time",
        "questionnaireOnHealthcareAccess",
    ),
    (
        "questionnaire_on_medical_history_time",
        "questionnaireOnMedicalHistory",
    ),
    (
        "questionnaire_on_medications_time",
        "questionnaireOnMedications",
    ),
    (
        "questionnaire_on_family_health_time",
        "questionnaireOnFamilyHealth",
    ),
];

/// The PPI modules that count towards `numCompletedBaselinePPIModules`.
pub const BASELINE_MODULES: &[&str] = &[
    "questionnaireOnTheBasics",
    "questionnaireOnOverallHealth",
    "questionnaireOnLifestyle",
];

/// Every tracked (non-derived) metric field, initialized to `UNSET` in a new
/// participant state.
pub fn metric_fields() -> Vec<&'static str> {
    let mut fields = vec![
        HPO_ID_METRIC,
        AGE_RANGE_METRIC,
        CENSUS_REGION_METRIC,
        RACE_METRIC,
        STATE_METRIC,
        GENDER_IDENTITY_METRIC,
        BIOSPECIMEN_METRIC,
        BIOSPECIMEN_SAMPLES_METRIC,
        PHYSICAL_MEASUREMENTS_METRIC,
        SAMPLES_TO_ISOLATE_DNA_METRIC,
    ];
    fields.extend(MODULE_COLUMNS.iter().map(|(_, metric)| *metric));
    fields
}

/// Whether `name` is a tracked (non-derived) metric field.
pub fn is_metric_field(name: &str) -> bool {
    metric_fields().iter().any(|field| *field == name)
}

/// How a questionnaire answer is carried in the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// The answer is a code; the code value becomes the metric value.
    Code,
    /// The answer is free text; the string becomes the metric value.
    String,
}

/// Map a question code to the field it updates. Race is handled separately
/// (answers combine across rows) and does not appear here.
pub fn question_field(question_code: &str) -> Option<(&'static str, FieldType)> {
    match question_code {
        "Gender_GenderIdentity" => Some((GENDER_IDENTITY_METRIC, FieldType::Code)),
        "StreetAddress_PIIState" => Some((STATE_METRIC, FieldType::Code)),
        _ => None,
    }
}

/// Recompute the derived fields of a participant state in place.
///
/// Derived fields are a pure function of the other fields and must be
/// refreshed after every state change.
pub fn update_summary_fields(state: &mut BTreeMap<ArcStr, ArcStr>) {
    let completed = BASELINE_MODULES
        .iter()
        .filter(|module| {
            state
                .get(**module)
                .map(|v| &**v == SUBMITTED_VALUE)
                .unwrap_or(false)
        })
        .count();
    state.insert(
        NUM_BASELINE_MODULES_METRIC.into(),
        completed.to_string().into(),
    );

    let submitted = |field: &str| {
        state
            .get(field)
            .map(|v| &**v == SUBMITTED_VALUE)
            .unwrap_or(false)
    };
    let is = |field: &str, value: &str| state.get(field).map(|v| &**v == value).unwrap_or(false);
    let status = if submitted("consentForElectronicHealthRecords")
        && completed == BASELINE_MODULES.len()
        && is(PHYSICAL_MEASUREMENTS_METRIC, COMPLETED_VALUE)
        && is(SAMPLES_TO_ISOLATE_DNA_METRIC, RECEIVED_VALUE)
    {
        FULL_PARTICIPANT_VALUE
    } else if submitted("consentForElectronicHealthRecords") {
        MEMBER_VALUE
    } else {
        INTERESTED_VALUE
    };
    state.insert(ENROLLMENT_STATUS_METRIC.into(), status.into());
}

/// Age range buckets, lower bound inclusive.
const AGE_BUCKETS: &[(u32, &str)] = &[
    (0, "0-17"),
    (18, "18-25"),
    (26, "26-35"),
    (36, "36-45"),
    (46, "46-55"),
    (56, "56-65"),
    (66, "66-75"),
    (76, "76-85"),
    (86, "86-"),
];

/// Whole years elapsed between `from` and `to`.
pub fn years_between(from: NaiveDate, to: NaiveDate) -> i32 {
    let mut years = to.year() - from.year();
    if (to.month(), to.day()) < (from.month(), from.day()) {
        years -= 1;
    }
    years
}

/// Add whole years to a date, clamping Feb 29 to Feb 28 in non-leap years.
pub fn add_years(date: NaiveDate, years: i32) -> NaiveDate {
    let year = date.year() + years;
    NaiveDate::from_ymd_opt(year, date.month(), date.day())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, 2, 28).unwrap())
}

/// The bucketed age range of someone born on `date_of_birth`, as of `on`.
pub fn bucketed_age(date_of_birth: NaiveDate, on: NaiveDate) -> &'static str {
    let age = years_between(date_of_birth, on).max(0) as u32;
    let mut bucket = AGE_BUCKETS[0].1;
    for (lower, label) in AGE_BUCKETS {
        if age >= *lower {
            bucket = label;
        }
    }
    bucket
}

const PREFER_NOT_TO_ANSWER_CODE: &str = "PMI_PreferNotToAnswer";
const SKIP_CODE: &str = "PMI_Skip";

fn race_for_code(code: &str) -> &'static str {
    match code {
        "WhatRaceEthnicity_White" => "WHITE",
        "WhatRaceEthnicity_Black" => "BLACK_OR_AFRICAN_AMERICAN",
        "WhatRaceEthnicity_Asian" => "ASIAN",
        "WhatRaceEthnicity_AIAN" => "AMERICAN_INDIAN_OR_ALASKA_NATIVE",
        "WhatRaceEthnicity_NHPI" => "NATIVE_HAWAIIAN_OR_OTHER_PACIFIC_ISLANDER",
        "WhatRaceEthnicity_MENA" => "MIDDLE_EASTERN_OR_NORTH_AFRICAN",
        "WhatRaceEthnicity_Hispanic" => "HISPANIC_LATINO_OR_SPANISH",
        _ => "OTHER_RACE",
    }
}

/// Combine the race answer codes a participant gave at one time into a
/// single race value.
pub fn resolve_race<'a>(codes: impl IntoIterator<Item = &'a str>) -> &'static str {
    let mut races = Vec::new();
    let mut prefer_not_to_answer = false;
    for code in codes {
        if code == SKIP_CODE {
            continue;
        }
        if code == PREFER_NOT_TO_ANSWER_CODE {
            prefer_not_to_answer = true;
            continue;
        }
        let race = race_for_code(code);
        if !races.contains(&race) {
            races.push(race);
        }
    }
    match (races.len(), prefer_not_to_answer) {
        (0, true) => "PREFER_NOT_TO_SAY",
        (0, false) => UNSET,
        (1, false) => races[0],
        _ => "MORE_THAN_ONE_RACE",
    }
}

static CENSUS_REGIONS: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    for state in ["CT", "ME", "MA", "NH", "NJ", "NY", "PA", "RI", "VT"] {
        m.insert(state, "NORTHEAST");
    }
    for state in [
        "IL", "IN", "IA", "KS", "MI", "MN", "MO", "NE", "ND", "OH", "SD", "WI",
    ] {
        m.insert(state, "MIDWEST");
    }
    for state in [
        "AL", "AR", "DE", "DC", "FL", "GA", "KY", "LA", "MD", "MS", "NC", "OK", "SC", "TN", "TX",
        "VA", "WV",
    ] {
        m.insert(state, "SOUTH");
    }
    for state in [
        "AK", "AZ", "CA", "CO", "HI", "ID", "MT", "NV", "NM", "OR", "UT", "WA", "WY",
    ] {
        m.insert(state, "WEST");
    }
    m
});

/// The census region for a two-letter state postal code, or `UNSET` when the
/// state is unknown.
pub fn census_region(state: &str) -> &'static str {
    CENSUS_REGIONS.get(state).copied().unwrap_or(UNSET)
}
