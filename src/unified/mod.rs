//! Raw record → unified schema transforms.
//!
//! One pure function per record kind, wired through an explicit dispatch
//! table. Transforms are idempotent end to end: identity resolution is
//! get-or-create and entity inserts skip on conflict, so replaying a
//! record is a no-op.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::store::{
    HealthStore, LabResultRow, SleepSessionRow, VitalRow, WorkoutRow,
};

type TransformFn = fn(&HealthStore, &Value) -> Result<()>;

/// Record kind → transform. Kinds without an entry are raw-only.
pub const TRANSFORMS: &[(&str, TransformFn)] = &[
    ("sleeps", transform_sleep),
    ("workouts", transform_workout),
    ("recoveries", transform_recovery),
    ("profile", transform_profile),
    ("quest_patient", transform_quest_patient),
    ("quest_observation", transform_observation),
];

pub fn transform_record(store: &HealthStore, kind: &str, record: &Value) -> Result<()> {
    match TRANSFORMS.iter().find(|(k, _)| *k == kind) {
        Some((_, f)) => f(store, record),
        None => Ok(()),
    }
}

/// Stringify a JSON id that may arrive as number or string.
pub fn key_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds → whole minutes, rounding half up.
fn millis_to_minutes(ms: i64) -> i64 {
    (ms + 30_000) / 60_000
}

fn str_at<'a>(record: &'a Value, pointer: &str) -> Option<&'a str> {
    record.pointer(pointer).and_then(Value::as_str)
}

fn f64_at(record: &Value, pointer: &str) -> Option<f64> {
    record.pointer(pointer).and_then(Value::as_f64)
}

fn i64_at(record: &Value, pointer: &str) -> Option<i64> {
    record.pointer(pointer).and_then(Value::as_i64)
}

fn stage_minutes(record: &Value, pointer: &str) -> Option<i64> {
    i64_at(record, pointer).map(millis_to_minutes)
}

fn transform_sleep(store: &HealthStore, record: &Value) -> Result<()> {
    // No user or no id means nothing to anchor the row to; leave it raw-only.
    let (Some(user_id), Some(raw_id)) = (
        record.get("user_id").and_then(key_string),
        record.get("id").and_then(key_string),
    ) else {
        return Ok(());
    };
    let internal = store.get_or_create_identity("whoop", &user_id, None, None, None)?;

    let start = record.get("start").and_then(Value::as_str);
    let end = record.get("end").and_then(Value::as_str);
    let duration_minutes = match (start.and_then(parse_iso), end.and_then(parse_iso)) {
        (Some(s), Some(e)) => Some((e - s).num_minutes()),
        _ => None,
    };

    store.insert_sleep_session(&SleepSessionRow {
        internal_user_id: internal,
        start_time: start.map(str::to_string),
        end_time: end.map(str::to_string),
        duration_minutes,
        efficiency_pct: f64_at(record, "/score/sleep_efficiency_percentage"),
        rem_minutes: stage_minutes(record, "/score/stage_summary/total_rem_sleep_time_milli"),
        deep_minutes: stage_minutes(
            record,
            "/score/stage_summary/total_slow_wave_sleep_time_milli",
        ),
        light_minutes: stage_minutes(record, "/score/stage_summary/total_light_sleep_time_milli"),
        awake_minutes: stage_minutes(record, "/score/stage_summary/total_awake_time_milli"),
        respiratory_rate: f64_at(record, "/score/respiratory_rate"),
        source_system: "whoop".to_string(),
        raw_source_id: raw_id.clone(),
        raw: record.to_string(),
    })?;

    // Respiratory rate doubles as a vital, anchored at sleep start.
    if let (Some(rate), Some(start)) = (f64_at(record, "/score/respiratory_rate"), start) {
        store.insert_vital(&VitalRow {
            internal_user_id: internal,
            recorded_at: start.to_string(),
            vital_type: "respiratory_rate".to_string(),
            value_num: Some(rate),
            unit: Some("breaths/min".to_string()),
            source_system: "whoop".to_string(),
            raw_source_id: Some(raw_id),
            raw: record.to_string(),
        })?;
    }
    Ok(())
}

fn transform_workout(store: &HealthStore, record: &Value) -> Result<()> {
    let (Some(user_id), Some(raw_id)) = (
        record.get("user_id").and_then(key_string),
        record.get("id").and_then(key_string),
    ) else {
        return Ok(());
    };
    let internal = store.get_or_create_identity("whoop", &user_id, None, None, None)?;

    store.insert_workout(&WorkoutRow {
        internal_user_id: internal,
        start_time: str_at(record, "/start").map(str::to_string),
        end_time: str_at(record, "/end").map(str::to_string),
        sport: str_at(record, "/sport_name").map(str::to_string),
        average_hr: i64_at(record, "/score/average_heart_rate"),
        max_hr: i64_at(record, "/score/max_heart_rate"),
        strain: f64_at(record, "/score/strain"),
        energy_kj: f64_at(record, "/score/kilojoule"),
        distance_m: f64_at(record, "/score/distance_meter"),
        altitude_gain_m: f64_at(record, "/score/altitude_gain_meter"),
        altitude_change_m: f64_at(record, "/score/altitude_change_meter"),
        source_system: "whoop".to_string(),
        raw_source_id: raw_id,
        raw: record.to_string(),
    })?;
    Ok(())
}

/// Vitals emitted from a recovery score, one row per present sub-metric.
const RECOVERY_VITALS: &[(&str, &str, &str)] = &[
    ("/score/resting_heart_rate", "resting_hr", "bpm"),
    ("/score/hrv_rmssd_milli", "hrv_rmssd", "ms"),
    ("/score/spo2_percentage", "spo2_pct", "percent"),
    ("/score/skin_temp_celsius", "skin_temp_celsius", "C"),
    ("/score/recovery_score", "recovery_score", "score"),
];

fn transform_recovery(store: &HealthStore, record: &Value) -> Result<()> {
    let (Some(user_id), Some(cycle_id)) = (
        record.get("user_id").and_then(key_string),
        record.get("cycle_id").and_then(key_string),
    ) else {
        return Ok(());
    };
    let internal = store.get_or_create_identity("whoop", &user_id, None, None, None)?;

    let recorded_at = match str_at(record, "/created_at").or_else(|| str_at(record, "/updated_at"))
    {
        Some(ts) => ts.to_string(),
        None => {
            tracing::warn!(cycle_id, "recovery has no timestamp, using processing time");
            Utc::now().to_rfc3339()
        }
    };

    for (pointer, vital_type, unit) in RECOVERY_VITALS {
        let Some(value) = f64_at(record, pointer) else {
            continue;
        };
        store.insert_vital(&VitalRow {
            internal_user_id: internal,
            recorded_at: recorded_at.clone(),
            vital_type: vital_type.to_string(),
            value_num: Some(value),
            unit: Some(unit.to_string()),
            source_system: "whoop".to_string(),
            raw_source_id: Some(cycle_id.clone()),
            raw: record.to_string(),
        })?;
    }
    Ok(())
}

fn transform_profile(store: &HealthStore, record: &Value) -> Result<()> {
    let Some(user_id) = record.get("user_id").and_then(key_string) else {
        return Ok(());
    };
    store.get_or_create_identity(
        "whoop",
        &user_id,
        record.get("email").and_then(Value::as_str),
        record.get("first_name").and_then(Value::as_str),
        record.get("last_name").and_then(Value::as_str),
    )?;
    Ok(())
}

fn transform_quest_patient(store: &HealthStore, record: &Value) -> Result<()> {
    let Some(patient_id) = record.get("id").and_then(key_string) else {
        return Ok(());
    };
    store.get_or_create_identity(
        "quest",
        &patient_id,
        str_at(record, "/telecom/0/value"),
        str_at(record, "/name/0/given/0"),
        str_at(record, "/name/0/family"),
    )?;
    Ok(())
}

fn transform_observation(store: &HealthStore, record: &Value) -> Result<()> {
    // Without a resolvable patient or an id the row cannot be keyed; skip.
    let Some(patient_id) = str_at(record, "/subject/reference")
        .and_then(|r| r.strip_prefix("Patient/"))
        .filter(|id| !id.is_empty())
    else {
        return Ok(());
    };
    let Some(raw_id) = record.get("id").and_then(key_string) else {
        return Ok(());
    };
    let internal = store.get_or_create_identity("quest", patient_id, None, None, None)?;

    let value_num = f64_at(record, "/valueQuantity/value");
    let value_text = if value_num.is_some() {
        None
    } else {
        str_at(record, "/valueString")
            .or_else(|| str_at(record, "/valueCodeableConcept/text"))
            .map(str::to_string)
    };

    store.insert_lab_result(&LabResultRow {
        internal_user_id: internal,
        loinc_code: str_at(record, "/code/coding/0/code").map(str::to_string),
        test_name: str_at(record, "/code/coding/0/display").map(str::to_string),
        collected_at: str_at(record, "/effectiveDateTime")
            .or_else(|| str_at(record, "/issued"))
            .map(str::to_string),
        value_num,
        value_text,
        unit: str_at(record, "/valueQuantity/unit").map(str::to_string),
        reference_low: f64_at(record, "/referenceRange/0/low/value"),
        reference_high: f64_at(record, "/referenceRange/0/high/value"),
        abnormal_flag: str_at(record, "/interpretation/0/coding/0/code")
            .or_else(|| str_at(record, "/interpretation/coding/0/code"))
            .map(str::to_string),
        source_system: "quest".to_string(),
        raw_source_id: raw_id,
        raw: record.to_string(),
    })?;
    Ok(())
}
