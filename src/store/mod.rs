//! SQLite-backed store for credentials, raw capture, and unified entities.
//!
//! A single database file holds all three layers. The connection sits
//! behind a mutex so the store can be shared across async tasks; writes
//! rely on the idempotent-upsert invariants of the schema rather than
//! client-side coordination.

mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;

pub use schema::SCHEMA;

/// An OAuth credential as persisted in `oauth_credentials`.
///
/// Credentials are append-only: a refresh supersedes the previous row
/// instead of mutating it, and the most recent row wins on load.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the credential is still usable at `now`, leaving a safety
    /// margin so the token cannot expire mid-request.
    pub fn usable_at(&self, now: DateTime<Utc>, safety_margin: chrono::Duration) -> bool {
        now + safety_margin < self.expires_at
    }
}

/// A resolved cross-source identity row.
#[derive(Debug, Clone)]
pub struct IdentityRow {
    pub internal_user_id: i64,
    pub source_system: String,
    pub source_user_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// A normalized sleep session.
#[derive(Debug, Clone)]
pub struct SleepSessionRow {
    pub internal_user_id: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub efficiency_pct: Option<f64>,
    pub rem_minutes: Option<i64>,
    pub deep_minutes: Option<i64>,
    pub light_minutes: Option<i64>,
    pub awake_minutes: Option<i64>,
    pub respiratory_rate: Option<f64>,
    pub source_system: String,
    pub raw_source_id: String,
    pub raw: String,
}

/// A normalized workout.
#[derive(Debug, Clone)]
pub struct WorkoutRow {
    pub internal_user_id: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub sport: Option<String>,
    pub average_hr: Option<i64>,
    pub max_hr: Option<i64>,
    pub strain: Option<f64>,
    pub energy_kj: Option<f64>,
    pub distance_m: Option<f64>,
    pub altitude_gain_m: Option<f64>,
    pub altitude_change_m: Option<f64>,
    pub source_system: String,
    pub raw_source_id: String,
    pub raw: String,
}

/// A single vital measurement (one row per sub-metric).
#[derive(Debug, Clone)]
pub struct VitalRow {
    pub internal_user_id: i64,
    pub recorded_at: String,
    pub vital_type: String,
    pub value_num: Option<f64>,
    pub unit: Option<String>,
    pub source_system: String,
    pub raw_source_id: Option<String>,
    pub raw: String,
}

/// A normalized lab result observation.
#[derive(Debug, Clone)]
pub struct LabResultRow {
    pub internal_user_id: i64,
    pub loinc_code: Option<String>,
    pub test_name: Option<String>,
    pub collected_at: Option<String>,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
    pub unit: Option<String>,
    pub reference_low: Option<f64>,
    pub reference_high: Option<f64>,
    pub abnormal_flag: Option<String>,
    pub source_system: String,
    pub raw_source_id: String,
    pub raw: String,
}

#[derive(Clone)]
pub struct HealthStore {
    conn: Arc<Mutex<Connection>>,
}

impl HealthStore {
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw SQL escape hatch for tests that need to break the schema.
    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    // ============================================
    // CREDENTIALS
    // ============================================

    pub fn save_credential(&self, source_system: &str, cred: &Credential) -> Result<()> {
        self.conn().execute(
            "INSERT INTO oauth_credentials (source_system, access_token, refresh_token, scope, token_type, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                source_system,
                cred.access_token,
                cred.refresh_token,
                cred.scope,
                cred.token_type,
                cred.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent credential for a source, if any.
    ///
    /// An unparsable expiry is conservatively treated as already expired
    /// rather than discarding the row (the refresh token may still work).
    pub fn load_latest_credential(&self, source_system: &str) -> Result<Option<Credential>> {
        let row = self
            .conn()
            .query_row(
                "SELECT access_token, refresh_token, scope, token_type, expires_at
                 FROM oauth_credentials
                 WHERE source_system = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![source_system],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(access_token, refresh_token, scope, token_type, expires_at)| {
            let expires_at = DateTime::parse_from_rfc3339(&expires_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            Credential {
                access_token,
                refresh_token,
                scope,
                token_type,
                expires_at,
            }
        }))
    }

    // ============================================
    // RAW CAPTURE
    // ============================================

    /// Idempotent upsert of a verbatim source record by natural key.
    pub fn upsert_raw(
        &self,
        source_system: &str,
        resource: &str,
        natural_key: &str,
        source_user_id: Option<&str>,
        record_start: Option<&str>,
        raw: &Value,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO raw_records (source_system, resource, natural_key, source_user_id, record_start, raw, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_system, resource, natural_key) DO UPDATE SET
                 source_user_id = excluded.source_user_id,
                 record_start = excluded.record_start,
                 raw = excluded.raw,
                 updated_at = excluded.updated_at",
            params![
                source_system,
                resource,
                natural_key,
                source_user_id,
                record_start,
                raw.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_raw(
        &self,
        source_system: &str,
        resource: &str,
        natural_key: &str,
    ) -> Result<Option<String>> {
        let raw = self
            .conn()
            .query_row(
                "SELECT raw FROM raw_records
                 WHERE source_system = ? AND resource = ? AND natural_key = ?",
                params![source_system, resource, natural_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw)
    }

    pub fn count_raw(&self, source_system: &str, resource: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM raw_records WHERE source_system = ? AND resource = ?",
            params![source_system, resource],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete raw rows whose record_start falls within [start, end).
    /// Used by the daily-refresh path before re-ingesting a window.
    pub fn delete_raw_in_window(
        &self,
        source_system: &str,
        resources: &[&str],
        start: &str,
        end: &str,
    ) -> Result<usize> {
        let conn = self.conn();
        let mut deleted = 0;
        for resource in resources {
            deleted += conn.execute(
                "DELETE FROM raw_records
                 WHERE source_system = ? AND resource = ?
                   AND record_start >= ? AND record_start < ?",
                params![source_system, resource, start, end],
            )?;
        }
        Ok(deleted)
    }

    // ============================================
    // UNIFIED: IDENTITY
    // ============================================

    /// Resolve (source_system, source_user_id) to a stable internal id,
    /// creating the identity on first sight. Repeat sightings bump
    /// last_seen and fill in email/name fields non-destructively (a new
    /// non-null value wins; existing values are never nulled out).
    pub fn get_or_create_identity(
        &self,
        source_system: &str,
        source_user_id: &str,
        email: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT internal_user_id FROM user_identity
                 WHERE source_system = ? AND source_user_id = ?",
                params![source_system, source_user_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(internal_id) = existing {
            conn.execute(
                "UPDATE user_identity SET
                     last_seen = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                     email = COALESCE(?, email),
                     first_name = COALESCE(?, first_name),
                     last_name = COALESCE(?, last_name)
                 WHERE internal_user_id = ?",
                params![email, first_name, last_name, internal_id],
            )?;
            return Ok(internal_id);
        }

        conn.execute(
            "INSERT INTO user_identity (source_system, source_user_id, email, first_name, last_name)
             VALUES (?, ?, ?, ?, ?)",
            params![source_system, source_user_id, email, first_name, last_name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_identity(
        &self,
        source_system: &str,
        source_user_id: &str,
    ) -> Result<Option<IdentityRow>> {
        let row = self
            .conn()
            .query_row(
                "SELECT internal_user_id, source_system, source_user_id, email, first_name, last_name
                 FROM user_identity
                 WHERE source_system = ? AND source_user_id = ?",
                params![source_system, source_user_id],
                |row| {
                    Ok(IdentityRow {
                        internal_user_id: row.get(0)?,
                        source_system: row.get(1)?,
                        source_user_id: row.get(2)?,
                        email: row.get(3)?,
                        first_name: row.get(4)?,
                        last_name: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_identities(&self) -> Result<i64> {
        let count =
            self.conn()
                .query_row("SELECT COUNT(*) FROM user_identity", [], |row| row.get(0))?;
        Ok(count)
    }

    // ============================================
    // UNIFIED: ENTITIES (insert-or-skip)
    // ============================================

    pub fn insert_sleep_session(&self, row: &SleepSessionRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sleep_sessions
                 (internal_user_id, start_time, end_time, duration_minutes, efficiency_pct,
                  rem_minutes, deep_minutes, light_minutes, awake_minutes, respiratory_rate,
                  source_system, raw_source_id, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_system, raw_source_id) DO NOTHING",
            params![
                row.internal_user_id,
                row.start_time,
                row.end_time,
                row.duration_minutes,
                row.efficiency_pct,
                row.rem_minutes,
                row.deep_minutes,
                row.light_minutes,
                row.awake_minutes,
                row.respiratory_rate,
                row.source_system,
                row.raw_source_id,
                row.raw,
            ],
        )?;
        Ok(())
    }

    pub fn insert_workout(&self, row: &WorkoutRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO workouts
                 (internal_user_id, start_time, end_time, sport, average_hr, max_hr, strain,
                  energy_kj, distance_m, altitude_gain_m, altitude_change_m,
                  source_system, raw_source_id, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_system, raw_source_id) DO NOTHING",
            params![
                row.internal_user_id,
                row.start_time,
                row.end_time,
                row.sport,
                row.average_hr,
                row.max_hr,
                row.strain,
                row.energy_kj,
                row.distance_m,
                row.altitude_gain_m,
                row.altitude_change_m,
                row.source_system,
                row.raw_source_id,
                row.raw,
            ],
        )?;
        Ok(())
    }

    pub fn insert_vital(&self, row: &VitalRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO vital_measurements
                 (internal_user_id, recorded_at, type, value_num, unit,
                  source_system, raw_source_id, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(internal_user_id, recorded_at, type, source_system) DO NOTHING",
            params![
                row.internal_user_id,
                row.recorded_at,
                row.vital_type,
                row.value_num,
                row.unit,
                row.source_system,
                row.raw_source_id,
                row.raw,
            ],
        )?;
        Ok(())
    }

    pub fn insert_lab_result(&self, row: &LabResultRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO lab_results
                 (internal_user_id, loinc_code, test_name, collected_at, value_num, value_text,
                  unit, reference_low, reference_high, abnormal_flag,
                  source_system, raw_source_id, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_system, raw_source_id) DO NOTHING",
            params![
                row.internal_user_id,
                row.loinc_code,
                row.test_name,
                row.collected_at,
                row.value_num,
                row.value_text,
                row.unit,
                row.reference_low,
                row.reference_high,
                row.abnormal_flag,
                row.source_system,
                row.raw_source_id,
                row.raw,
            ],
        )?;
        Ok(())
    }

    // ============================================
    // QUERIES
    // ============================================

    pub fn get_sleep_session(
        &self,
        source_system: &str,
        raw_source_id: &str,
    ) -> Result<Option<SleepSessionRow>> {
        let row = self
            .conn()
            .query_row(
                "SELECT internal_user_id, start_time, end_time, duration_minutes, efficiency_pct,
                        rem_minutes, deep_minutes, light_minutes, awake_minutes, respiratory_rate,
                        source_system, raw_source_id, raw
                 FROM sleep_sessions
                 WHERE source_system = ? AND raw_source_id = ?",
                params![source_system, raw_source_id],
                |row| {
                    Ok(SleepSessionRow {
                        internal_user_id: row.get(0)?,
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        duration_minutes: row.get(3)?,
                        efficiency_pct: row.get(4)?,
                        rem_minutes: row.get(5)?,
                        deep_minutes: row.get(6)?,
                        light_minutes: row.get(7)?,
                        awake_minutes: row.get(8)?,
                        respiratory_rate: row.get(9)?,
                        source_system: row.get(10)?,
                        raw_source_id: row.get(11)?,
                        raw: row.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_vitals(&self, internal_user_id: i64) -> Result<Vec<VitalRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT internal_user_id, recorded_at, type, value_num, unit,
                    source_system, raw_source_id, raw
             FROM vital_measurements
             WHERE internal_user_id = ?
             ORDER BY recorded_at, type",
        )?;
        let rows = stmt.query_map(params![internal_user_id], |row| {
            Ok(VitalRow {
                internal_user_id: row.get(0)?,
                recorded_at: row.get(1)?,
                vital_type: row.get(2)?,
                value_num: row.get(3)?,
                unit: row.get(4)?,
                source_system: row.get(5)?,
                raw_source_id: row.get(6)?,
                raw: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_sleep_sessions(&self) -> Result<i64> {
        let count =
            self.conn()
                .query_row("SELECT COUNT(*) FROM sleep_sessions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_workouts(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM workouts", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_vitals(&self) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM vital_measurements",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_lab_results(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM lab_results", [], |row| row.get(0))?;
        Ok(count)
    }
}
