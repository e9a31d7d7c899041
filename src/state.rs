//! Stage-1 reduce: replay one participant's full event history and emit the
//! `±1` deltas that turn point-in-time state into running counts downstream.
//!
//! The reduction is a pure fold over the sorted events, so re-running it on
//! the same input always produces the same delta multiset (shards may be
//! retried freely).

use crate::{
    config::{
        add_years, bucketed_age, is_metric_field, metric_fields, update_summary_fields,
        years_between, AGE_RANGE_METRIC, ENROLLMENT_STATUS_METRIC, FULL_PARTICIPANT_VALUE,
        HPO_ID_METRIC,
    },
    event::{DeltaRow, EventPayload, GroupKey, Metric, ParticipantKind, UNSET},
    ArcStr, Result,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

/// State key for the synthetic per-participant total. Constant, so it only
/// produces deltas on registration, HPO moves and the full-participant
/// snapshot.
const TOTAL_SENTINEL: &str = "__total__";

type State = BTreeMap<ArcStr, ArcStr>;

fn metric_for(name: &ArcStr, value: &ArcStr) -> Result<Metric> {
    if &**name == TOTAL_SENTINEL {
        Ok(Metric::Total)
    } else {
        Metric::field(name.clone(), value.clone())
    }
}

/// Replay all events for one participant (in any order) and emit signed unit
/// deltas keyed by `(hpo, kind, metric, date)`.
///
/// A participant with no metric events produces no output. `now` bounds the
/// synthesized age-range transitions; events themselves may be future-dated
/// and are cut off downstream.
pub fn reduce_participant(events: Vec<EventPayload>, now: NaiveDateTime) -> Result<Vec<DeltaRow>> {
    let mut date_of_birth = None;
    let mut timeline: Vec<(NaiveDateTime, Metric)> = Vec::new();
    for event in events {
        match event {
            EventPayload::DateOfBirth(date) => date_of_birth = Some(date),
            EventPayload::Metric { time, metric } => timeline.push((time, metric)),
        }
    }
    if timeline.is_empty() {
        return Ok(Vec::new());
    }
    timeline.sort();

    let mut state: State = metric_fields()
        .into_iter()
        .map(|field| (ArcStr::from(field), ArcStr::from(UNSET)))
        .collect();
    state.insert(TOTAL_SENTINEL.into(), "1".into());

    // The first HPO assignment anywhere in the history is the HPO the
    // participant signed up under; it seeds the initial state.
    let mut last_hpo_id: ArcStr = UNSET.into();
    for (_, metric) in &timeline {
        if metric.name() == HPO_ID_METRIC {
            last_hpo_id = metric.value().into();
            state.insert(HPO_ID_METRIC.into(), last_hpo_id.clone());
            break;
        }
    }

    if let Some(dob) = date_of_birth {
        let start_range = add_age_range_events(&mut timeline, dob, now)?;
        state.insert(AGE_RANGE_METRIC.into(), start_range.into());
        timeline.sort();
    }

    update_summary_fields(&mut state);

    let mut deltas = Vec::new();
    let mut emit = |hpo_id: &ArcStr,
                    kind: ParticipantKind,
                    metric: Metric,
                    date: NaiveDate,
                    delta: i64|
     -> Result {
        deltas.push(DeltaRow {
            key: GroupKey::new(hpo_id.clone(), kind, metric)?,
            date,
            delta,
        });
        Ok(())
    };

    // Every field's initial value counts from the first event's date.
    let initial_date = timeline[0].0.date();
    for (name, value) in &state {
        emit(
            &last_hpo_id,
            ParticipantKind::Registered,
            metric_for(name, value)?,
            initial_date,
            1,
        )?;
    }

    let mut last_state = state;
    let mut full_participant = false;
    for (time, metric) in &timeline {
        let date = time.date();
        let mut new_state = last_state.clone();
        if !process_metric(metric, &mut new_state) {
            continue;
        }
        let hpo_id: ArcStr = new_state
            .get(HPO_ID_METRIC)
            .cloned()
            .unwrap_or_else(|| UNSET.into());
        let hpo_change = last_hpo_id != hpo_id;
        let last_full_participant = full_participant;

        for (name, value) in &new_state {
            let old_value = last_state.get(name);
            // A delta is due when this field changed; when the HPO moved,
            // every field moves with it.
            if !hpo_change && Some(value) == old_value {
                continue;
            }
            if &**name == ENROLLMENT_STATUS_METRIC
                && &**value == FULL_PARTICIPANT_VALUE
                && !full_participant
            {
                full_participant = true;
                // One-time bulk snapshot: the participant's entire current
                // state starts counting under the full tier today.
                for (name2, value2) in &new_state {
                    emit(
                        &hpo_id,
                        ParticipantKind::Full,
                        metric_for(name2, value2)?,
                        date,
                        1,
                    )?;
                }
            }
            emit(
                &hpo_id,
                ParticipantKind::Registered,
                metric_for(name, value)?,
                date,
                1,
            )?;
            if last_full_participant {
                emit(
                    &hpo_id,
                    ParticipantKind::Full,
                    metric_for(name, value)?,
                    date,
                    1,
                )?;
            }
            if let Some(old_value) = old_value {
                emit(
                    &last_hpo_id,
                    ParticipantKind::Registered,
                    metric_for(name, old_value)?,
                    date,
                    -1,
                )?;
                if last_full_participant {
                    emit(
                        &last_hpo_id,
                        ParticipantKind::Full,
                        metric_for(name, old_value)?,
                        date,
                        -1,
                    )?;
                }
            }
        }

        last_state = new_state;
        last_hpo_id = hpo_id;
    }
    Ok(deltas)
}

/// Apply one metric event to the state. Returns false (leaving the state
/// untouched) when the field is untracked or the value is unchanged;
/// otherwise updates the field and refreshes the derived fields.
fn process_metric(metric: &Metric, new_state: &mut State) -> bool {
    let (name, value) = match metric {
        // Events never carry the synthetic total.
        Metric::Total => return false,
        Metric::Field { name, value } => (name, value),
    };
    if !is_metric_field(name) {
        return false;
    }
    match new_state.get_mut(name) {
        Some(current) if current != value => *current = value.clone(),
        _ => return false,
    }
    update_summary_fields(new_state);
    true
}

/// Synthesize an age-range change event at each birthday (up to `now`) where
/// the bucketed range differs from the previous one. Returns the range at
/// the participant's first event date.
fn add_age_range_events(
    timeline: &mut Vec<(NaiveDateTime, Metric)>,
    date_of_birth: NaiveDate,
    now: NaiveDateTime,
) -> Result<&'static str> {
    let creation_date = timeline[0].0.date();
    let start_range = bucketed_age(date_of_birth, creation_date);
    let mut previous = start_range;
    let mut years = years_between(date_of_birth, creation_date) + 1;
    let mut date = add_years(date_of_birth, years);
    while date <= now.date() {
        let range = bucketed_age(date_of_birth, date);
        if range != previous {
            timeline.push((
                date.and_hms_opt(0, 0, 0).unwrap(),
                Metric::field(AGE_RANGE_METRIC, range)?,
            ));
            previous = range;
        }
        years += 1;
        date = add_years(date_of_birth, years);
    }
    Ok(start_range)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn event(s: &str) -> EventPayload {
        s.parse().unwrap()
    }

    fn lines(deltas: &[DeltaRow]) -> Vec<String> {
        deltas.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn no_events_no_output() {
        assert!(reduce_participant(vec![], now()).unwrap().is_empty());
        // A date of birth alone is not an event history.
        let dob = vec![event("DOB|1980-05-01")];
        assert!(reduce_participant(dob, now()).unwrap().is_empty());
    }

    #[test]
    fn initial_state_counts_from_first_event() {
        let deltas = reduce_participant(
            vec![event("2017-01-01 10:00:00|hpoId.PITT")],
            now(),
        )
        .unwrap();
        let lines = lines(&deltas);
        assert!(lines.contains(&"PITT|R|Participant|2017-01-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|hpoId.PITT|2017-01-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|race.UNSET|2017-01-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|enrollmentStatus.INTERESTED|2017-01-01|1".to_string()));
        // Only the initial snapshot: the replayed HPO event is a no-op.
        assert!(deltas.iter().all(|d| d.delta == 1
            && d.date == NaiveDate::from_ymd_opt(2017, 1, 1).unwrap()
            && d.key.kind == ParticipantKind::Registered));
    }

    #[test]
    fn value_change_emits_paired_deltas() {
        let deltas = reduce_participant(
            vec![
                event("2017-01-01 10:00:00|hpoId.PITT"),
                event("2017-02-01 10:00:00|questionnaireOnTheBasics.SUBMITTED"),
            ],
            now(),
        )
        .unwrap();
        let lines = lines(&deltas);
        assert!(lines.contains(&"PITT|R|questionnaireOnTheBasics.SUBMITTED|2017-02-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|questionnaireOnTheBasics.UNSET|2017-02-01|-1".to_string()));
        // The derived module count moved with it.
        assert!(lines.contains(&"PITT|R|numCompletedBaselinePPIModules.1|2017-02-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|numCompletedBaselinePPIModules.0|2017-02-01|-1".to_string()));
    }

    #[test]
    fn repeated_value_is_a_no_op() {
        let once = reduce_participant(
            vec![
                event("2017-01-01 10:00:00|hpoId.PITT"),
                event("2017-02-01 10:00:00|race.WHITE"),
            ],
            now(),
        )
        .unwrap();
        let twice = reduce_participant(
            vec![
                event("2017-01-01 10:00:00|hpoId.PITT"),
                event("2017-02-01 10:00:00|race.WHITE"),
                event("2017-03-01 10:00:00|race.WHITE"),
            ],
            now(),
        )
        .unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn deterministic_regardless_of_input_order() {
        let events = vec![
            event("2017-02-01 10:00:00|race.WHITE"),
            event("2017-01-01 10:00:00|hpoId.PITT"),
            event("DOB|1990-05-01"),
            event("2017-03-01 10:00:00|questionnaireOnTheBasics.SUBMITTED"),
        ];
        let mut reversed = events.clone();
        reversed.reverse();
        let a = reduce_participant(events.clone(), now()).unwrap();
        let b = reduce_participant(reversed, now()).unwrap();
        let c = reduce_participant(events, now()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    fn full_participant_events() -> Vec<EventPayload> {
        vec![
            event("2017-01-01 10:00:00|hpoId.PITT"),
            event("2017-01-01 10:00:01|consentForStudyEnrollment.SUBMITTED"),
            event("2017-01-01 10:00:02|consentForElectronicHealthRecords.SUBMITTED"),
            event("2017-01-02 10:00:00|questionnaireOnTheBasics.SUBMITTED"),
            event("2017-01-02 10:00:01|questionnaireOnOverallHealth.SUBMITTED"),
            event("2017-01-02 10:00:02|questionnaireOnLifestyle.SUBMITTED"),
            event("2017-02-01 10:00:00|physicalMeasurements.COMPLETED"),
            event("2017-03-01 10:00:00|samplesToIsolateDNA.RECEIVED"),
        ]
    }

    #[test]
    fn full_transition_emits_bulk_snapshot() {
        let deltas = reduce_participant(full_participant_events(), now()).unwrap();
        let lines = lines(&deltas);

        // The DNA sample on 2017-03-01 tips enrollment status over to full;
        // the whole current state snapshots under F that day.
        let full_snapshot: Vec<_> = deltas
            .iter()
            .filter(|d| {
                d.key.kind == ParticipantKind::Full
                    && d.delta == 1
                    && d.date == NaiveDate::from_ymd_opt(2017, 3, 1).unwrap()
            })
            .collect();
        let state_size = metric_fields().len() + 2 /* summary */ + 1 /* total */;
        assert_eq!(full_snapshot.len(), state_size);
        assert!(lines.contains(&"PITT|F|Participant|2017-03-01|1".to_string()));
        assert!(lines.contains(&"PITT|F|race.UNSET|2017-03-01|1".to_string()));
        assert!(
            lines.contains(&"PITT|F|enrollmentStatus.FULL_PARTICIPANT|2017-03-01|1".to_string())
        );
        // The registered-tier transition for the status field still happens.
        assert!(
            lines.contains(&"PITT|R|enrollmentStatus.FULL_PARTICIPANT|2017-03-01|1".to_string())
        );
        assert!(lines.contains(&"PITT|R|enrollmentStatus.MEMBER|2017-03-01|-1".to_string()));
        // Nothing retracts under F on the transition day.
        assert!(deltas.iter().all(|d| {
            d.key.kind != ParticipantKind::Full
                || d.delta == 1
                || d.date != NaiveDate::from_ymd_opt(2017, 3, 1).unwrap()
        }));
    }

    #[test]
    fn full_tier_mirrors_later_changes() {
        let mut events = full_participant_events();
        events.push(event("2017-04-01 10:00:00|race.WHITE"));
        let deltas = reduce_participant(events, now()).unwrap();
        let lines = lines(&deltas);
        assert!(lines.contains(&"PITT|R|race.WHITE|2017-04-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|race.UNSET|2017-04-01|-1".to_string()));
        assert!(lines.contains(&"PITT|F|race.WHITE|2017-04-01|1".to_string()));
        assert!(lines.contains(&"PITT|F|race.UNSET|2017-04-01|-1".to_string()));
    }

    #[test]
    fn hpo_move_shifts_every_field() {
        let deltas = reduce_participant(
            vec![
                event("2017-01-01 10:00:00|hpoId.PITT"),
                event("2017-02-01 10:00:00|hpoId.COLUMBIA"),
            ],
            now(),
        )
        .unwrap();
        let lines = lines(&deltas);
        assert!(lines.contains(&"COLUMBIA|R|Participant|2017-02-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|Participant|2017-02-01|-1".to_string()));
        assert!(lines.contains(&"COLUMBIA|R|race.UNSET|2017-02-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|race.UNSET|2017-02-01|-1".to_string()));
    }

    #[test]
    fn age_range_transitions_are_synthesized() {
        let deltas = reduce_participant(
            vec![
                event("DOB|1999-06-15"),
                event("2017-01-01 10:00:00|hpoId.PITT"),
            ],
            now(),
        )
        .unwrap();
        let lines = lines(&deltas);
        // 17 at the first event, 18 on the birthday during the run window.
        assert!(lines.contains(&"PITT|R|ageRange.0-17|2017-01-01|1".to_string()));
        assert!(lines.contains(&"PITT|R|ageRange.18-25|2017-06-15|1".to_string()));
        assert!(lines.contains(&"PITT|R|ageRange.0-17|2017-06-15|-1".to_string()));
        // No transitions beyond now.
        assert!(deltas
            .iter()
            .all(|d| d.date <= NaiveDate::from_ymd_opt(2017, 12, 31).unwrap()));
    }

    /// Net Registered deltas per metric equal 1 for the value currently
    /// held, 0 for values no longer held.
    #[test]
    fn deltas_form_set_membership_counter() {
        let mut events = full_participant_events();
        events.push(event("2017-04-01 10:00:00|race.WHITE"));
        events.push(event("2017-05-01 10:00:00|race.MORE_THAN_ONE_RACE"));
        events.push(event("2017-06-01 10:00:00|hpoId.COLUMBIA"));
        let deltas = reduce_participant(events, now()).unwrap();

        let mut net: BTreeMap<String, i64> = BTreeMap::new();
        for delta in deltas
            .iter()
            .filter(|d| d.key.kind == ParticipantKind::Registered)
        {
            *net.entry(format!("{}|{}", delta.key.hpo_id, delta.key.metric))
                .or_default() += delta.delta;
        }
        for (key, sum) in &net {
            assert!(
                *sum == 0 || *sum == 1,
                "net delta for {} should be 0 or 1, got {}",
                key,
                sum
            );
        }
        assert_eq!(net["COLUMBIA|race.MORE_THAN_ONE_RACE"], 1);
        assert_eq!(net["PITT|race.MORE_THAN_ONE_RACE"], 0);
        assert_eq!(net["PITT|race.WHITE"], 0);
        assert_eq!(net["COLUMBIA|Participant"], 1);
        assert_eq!(net["PITT|Participant"], 0);
    }
}
