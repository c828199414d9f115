//! SQLite schema definition
//!
//! Three layers share one database file:
//! - oauth_credentials: append-only credential history, latest row wins
//! - raw_records: verbatim source payloads, one row per natural key
//! - unified entities: cross-source normalized rows keyed by internal identity

pub const SCHEMA: &str = r#"
-- ============================================
-- CREDENTIALS
-- ============================================

-- Append-only: each obtained or refreshed credential is a new row.
-- The current credential is the most recent row per source_system.
CREATE TABLE IF NOT EXISTS oauth_credentials (
    id INTEGER PRIMARY KEY,
    source_system TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    scope TEXT,
    token_type TEXT,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_credentials_source
    ON oauth_credentials(source_system, created_at DESC);

-- ============================================
-- RAW CAPTURE
-- ============================================

-- One row per (source, resource, natural key); re-ingestion overwrites
-- the payload and bumps updated_at, never duplicates.
CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY,
    source_system TEXT NOT NULL,
    resource TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    source_user_id TEXT,
    record_start TEXT,                     -- record's own event timestamp, for window filters
    raw TEXT NOT NULL,                     -- verbatim JSON payload
    updated_at TEXT NOT NULL,
    UNIQUE(source_system, resource, natural_key)
);

CREATE INDEX IF NOT EXISTS idx_raw_resource ON raw_records(source_system, resource);
CREATE INDEX IF NOT EXISTS idx_raw_start ON raw_records(record_start);

-- ============================================
-- UNIFIED: IDENTITY
-- ============================================

CREATE TABLE IF NOT EXISTS user_identity (
    internal_user_id INTEGER PRIMARY KEY,
    source_system TEXT NOT NULL,
    source_user_id TEXT NOT NULL,
    email TEXT,
    first_name TEXT,
    last_name TEXT,
    first_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    last_seen TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(source_system, source_user_id)
);

-- ============================================
-- UNIFIED: ENTITIES
-- ============================================

CREATE TABLE IF NOT EXISTS sleep_sessions (
    id INTEGER PRIMARY KEY,
    internal_user_id INTEGER NOT NULL,
    start_time TEXT,
    end_time TEXT,
    duration_minutes INTEGER,
    efficiency_pct REAL,
    rem_minutes INTEGER,
    deep_minutes INTEGER,
    light_minutes INTEGER,
    awake_minutes INTEGER,
    respiratory_rate REAL,
    source_system TEXT NOT NULL,
    raw_source_id TEXT NOT NULL,
    raw TEXT NOT NULL,
    UNIQUE(source_system, raw_source_id),
    FOREIGN KEY(internal_user_id) REFERENCES user_identity(internal_user_id)
);

CREATE TABLE IF NOT EXISTS workouts (
    id INTEGER PRIMARY KEY,
    internal_user_id INTEGER NOT NULL,
    start_time TEXT,
    end_time TEXT,
    sport TEXT,
    average_hr INTEGER,
    max_hr INTEGER,
    strain REAL,
    energy_kj REAL,
    distance_m REAL,
    altitude_gain_m REAL,
    altitude_change_m REAL,
    source_system TEXT NOT NULL,
    raw_source_id TEXT NOT NULL,
    raw TEXT NOT NULL,
    UNIQUE(source_system, raw_source_id),
    FOREIGN KEY(internal_user_id) REFERENCES user_identity(internal_user_id)
);

-- Derived vitals have no source-native id of their own; uniqueness is on
-- the semantic key (who, when, what, from where).
CREATE TABLE IF NOT EXISTS vital_measurements (
    id INTEGER PRIMARY KEY,
    internal_user_id INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    type TEXT NOT NULL,
    value_num REAL,
    unit TEXT,
    source_system TEXT NOT NULL,
    raw_source_id TEXT,
    raw TEXT NOT NULL,
    UNIQUE(internal_user_id, recorded_at, type, source_system),
    FOREIGN KEY(internal_user_id) REFERENCES user_identity(internal_user_id)
);

CREATE TABLE IF NOT EXISTS lab_results (
    id INTEGER PRIMARY KEY,
    internal_user_id INTEGER NOT NULL,
    loinc_code TEXT,
    test_name TEXT,
    collected_at TEXT,
    value_num REAL,
    value_text TEXT,
    unit TEXT,
    reference_low REAL,
    reference_high REAL,
    abnormal_flag TEXT,
    source_system TEXT NOT NULL,
    raw_source_id TEXT NOT NULL,
    raw TEXT NOT NULL,
    UNIQUE(source_system, raw_source_id),
    FOREIGN KEY(internal_user_id) REFERENCES user_identity(internal_user_id)
);

-- ============================================
-- INDEXES
-- ============================================

CREATE INDEX IF NOT EXISTS idx_sleep_user ON sleep_sessions(internal_user_id);
CREATE INDEX IF NOT EXISTS idx_sleep_start ON sleep_sessions(start_time);
CREATE INDEX IF NOT EXISTS idx_workouts_user ON workouts(internal_user_id);
CREATE INDEX IF NOT EXISTS idx_workouts_start ON workouts(start_time);
CREATE INDEX IF NOT EXISTS idx_vitals_user_type ON vital_measurements(internal_user_id, type);
CREATE INDEX IF NOT EXISTS idx_labs_user ON lab_results(internal_user_id);
CREATE INDEX IF NOT EXISTS idx_labs_code ON lab_results(loinc_code);
"#;
