// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the lightnvr SQLite schema.
//!
//! The SQLite schema includes everything except the media files themselves
//! (`.mp4` recordings, HLS segments, thumbnails). See `schema.sql` for a more
//! detailed description.
//!
//! The [`Database`] struct caches data in RAM, making the assumption that only
//! one process is accessing the database at a time:
//!
//! *   stream configurations are cached on open and updated on successful
//!     writes, so per-frame and per-cycle readers never touch SQLite.
//! *   per-stream storage summaries (byte totals, most recent recording) are
//!     rebuilt by the storage controller after each cleanup cycle.
//!
//! Queries here are expected to be quick; callers may hold the database lock
//! for the duration of one query but shouldn't perform file I/O under it,
//! with the deliberate exception of the orphan scan.

use crate::json::{GlobalConfig, StreamConfig};
use crate::raw;
use base::clock::{self, Clocks};
use base::{bail, err, Error, FastHashMap};
use rusqlite::params;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Expected schema version. See `upgrade/mod.rs` for upgrades.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

/// The reason a recording was created.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i64)]
pub enum TriggerType {
    Continuous = 0,
    Scheduled = 1,
    Detection = 2,
    Manual = 3,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Continuous => "continuous",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Detection => "detection",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continuous" => Some(TriggerType::Continuous),
            "scheduled" => Some(TriggerType::Scheduled),
            "detection" => Some(TriggerType::Detection),
            "manual" => Some(TriggerType::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::FromSql for TriggerType {
    fn column_result(
        value: rusqlite::types::ValueRef,
    ) -> rusqlite::types::FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(TriggerType::Continuous),
            1 => Ok(TriggerType::Scheduled),
            2 => Ok(TriggerType::Detection),
            3 => Ok(TriggerType::Manual),
            v => Err(rusqlite::types::FromSqlError::OutOfRange(v)),
        }
    }
}

impl rusqlite::types::ToSql for TriggerType {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok((*self as i64).into())
    }
}

/// Importance classification of a recording; each tier multiplies the base
/// retention period.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(i64)]
pub enum RetentionTier {
    Critical = 0,
    Important = 1,
    Standard = 2,
    Ephemeral = 3,
}

impl RetentionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RetentionTier::Critical => "critical",
            RetentionTier::Important => "important",
            RetentionTier::Standard => "standard",
            RetentionTier::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(RetentionTier::Critical),
            "important" => Some(RetentionTier::Important),
            "standard" => Some(RetentionTier::Standard),
            "ephemeral" => Some(RetentionTier::Ephemeral),
            _ => None,
        }
    }

    pub const ALL: [RetentionTier; 4] = [
        RetentionTier::Critical,
        RetentionTier::Important,
        RetentionTier::Standard,
        RetentionTier::Ephemeral,
    ];
}

impl std::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::FromSql for RetentionTier {
    fn column_result(
        value: rusqlite::types::ValueRef,
    ) -> rusqlite::types::FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(RetentionTier::Critical),
            1 => Ok(RetentionTier::Important),
            2 => Ok(RetentionTier::Standard),
            3 => Ok(RetentionTier::Ephemeral),
            v => Err(rusqlite::types::FromSqlError::OutOfRange(v)),
        }
    }
}

impl rusqlite::types::ToSql for RetentionTier {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok((*self as i64).into())
    }
}

/// A row of the `recording` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: PathBuf,
    pub size_bytes: i64,
    pub created_at: jiff::Timestamp,
    pub trigger: TriggerType,
    pub tier: RetentionTier,
    pub protected: bool,
}

/// Fields for creating a `recording` row; see [`LockedDatabase::insert_recording`].
#[derive(Clone, Debug)]
pub struct RecordingToInsert {
    pub stream_name: String,
    pub file_path: PathBuf,
    pub size_bytes: i64,
    pub created_at: jiff::Timestamp,
    pub trigger: TriggerType,
    pub tier: RetentionTier,
    pub protected: bool,
}

/// A single labelled bounding box observed on one stream at one instant.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub timestamp: jiff::Timestamp,
    pub label: String,
    pub confidence: f32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub zone_id: Option<i64>,
}

/// A named polygon per stream which detections must fall within.
#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    /// Row id; 0 means "not yet inserted" in [`LockedDatabase::upsert_zone`].
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub points: Vec<[f64; 2]>,
    pub classes: Vec<String>,
    pub min_confidence: f32,
}

/// Cached per-stream storage totals, rebuilt after each cleanup cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageSummary {
    pub total_bytes: u64,
    pub latest_recording: Option<jiff::Timestamp>,
}

/// Effective retention knobs for one stream, after resolving against the
/// global configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RetentionPolicy {
    /// Days to keep continuous/scheduled/manual recordings; 0 disables the
    /// time-based pass for them.
    pub retention_days: u32,

    /// Days to keep detection-triggered recordings.
    pub detection_retention_days: u32,

    /// Per-stream quota in mebibytes; 0 means unlimited.
    pub max_storage_mb: u64,

    /// Multiplier on `retention_days`, indexed by [`RetentionTier`].
    pub tier_multipliers: [f64; 4],
}

impl RetentionPolicy {
    /// Resolves a stream's retention configuration: stream values override the
    /// global default, and an unset detection horizon is three times the
    /// regular one.
    pub fn effective(cfg: &StreamConfig, global_retention_days: u32) -> Self {
        let retention_days = if cfg.retention_days > 0 {
            cfg.retention_days
        } else {
            global_retention_days
        };
        let detection_retention_days = if cfg.detection_retention_days > 0 {
            cfg.detection_retention_days
        } else {
            retention_days.saturating_mul(3)
        };
        Self {
            retention_days,
            detection_retention_days,
            max_storage_mb: cfg.max_storage_mb,
            tier_multipliers: [
                cfg.tier_critical_multiplier,
                cfg.tier_important_multiplier,
                cfg.tier_standard_multiplier,
                cfg.tier_ephemeral_multiplier,
            ],
        }
    }

    /// True iff every knob is off, meaning retention should skip the stream
    /// entirely.
    pub fn is_noop(&self) -> bool {
        self.retention_days == 0 && self.detection_retention_days == 0 && self.max_storage_mb == 0
    }
}

/// Checks that a stream name is usable as a path component and map key:
/// 1-63 printable characters with no separators.
pub fn validate_stream_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 63 {
        bail!(
            InvalidArgument,
            msg("stream name must be 1-63 bytes; got {}", name.len())
        );
    }
    for c in name.chars() {
        if c.is_control() || c == '/' || c == '\\' || c == '\0' {
            bail!(InvalidArgument, msg("stream name {name:?} contains {c:?}"));
        }
    }
    Ok(())
}

pub struct LockedDatabase {
    conn: rusqlite::Connection,
    global: GlobalConfig,
    streams_by_name: BTreeMap<String, StreamConfig>,
    storage_summaries: FastHashMap<String, StorageSummary>,
}

impl LockedDatabase {
    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn set_global(&mut self, config: GlobalConfig) -> Result<(), Error> {
        raw::write_meta(&self.conn, &config)?;
        self.global = config;
        Ok(())
    }

    /// All configured streams, by name.
    pub fn streams(&self) -> &BTreeMap<String, StreamConfig> {
        &self.streams_by_name
    }

    pub fn get_stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams_by_name.get(name)
    }

    pub fn upsert_stream(&mut self, name: &str, config: StreamConfig) -> Result<(), Error> {
        validate_stream_name(name)?;
        raw::upsert_stream(&self.conn, name, &config)?;
        self.streams_by_name.insert(name.to_owned(), config);
        Ok(())
    }

    /// Removes a stream's configuration. Its recordings' rows remain so the
    /// retention engine can still clean up their files.
    pub fn delete_stream(&mut self, name: &str) -> Result<(), Error> {
        if !raw::delete_stream(&self.conn, name)? {
            bail!(NotFound, msg("no such stream {name}"));
        }
        self.streams_by_name.remove(name);
        Ok(())
    }

    /// Resolves the effective retention policy for the given stream.
    pub fn effective_retention(&self, name: &str) -> Result<RetentionPolicy, Error> {
        let cfg = self
            .streams_by_name
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("no such stream {name}")))?;
        Ok(RetentionPolicy::effective(cfg, self.global.retention_days))
    }

    pub fn insert_recording(&mut self, r: &RecordingToInsert) -> Result<i64, Error> {
        raw::insert_recording(&self.conn, r)
    }

    pub fn finalize_recording(&mut self, id: i64, size_bytes: i64) -> Result<(), Error> {
        raw::finalize_recording(&self.conn, id, size_bytes)
    }

    pub fn set_recording_protected(&mut self, id: i64, protected: bool) -> Result<(), Error> {
        raw::set_recording_protected(&self.conn, id, protected)
    }

    /// Deletes a recording's metadata row and its thumbnail rows. The caller
    /// is responsible for the files.
    pub fn delete_recording(&mut self, id: i64) -> Result<(), Error> {
        raw::delete_recording(&self.conn, id)
    }

    pub fn recording_by_path(&self, path: &Path) -> Result<Option<Recording>, Error> {
        raw::recording_by_path(&self.conn, path)
    }

    /// Up to `limit` unprotected recordings of `name` older than the
    /// applicable horizon, oldest first. `regular_cutoff` applies to
    /// continuous/scheduled/manual recordings and `detection_cutoff` to
    /// detection-triggered ones; `None` excludes that class entirely.
    pub fn recordings_for_retention(
        &self,
        name: &str,
        regular_cutoff: Option<jiff::Timestamp>,
        detection_cutoff: Option<jiff::Timestamp>,
        limit: usize,
    ) -> Result<Vec<Recording>, Error> {
        // An i64::MIN cutoff matches nothing: created_at is non-negative.
        let reg = regular_cutoff.map(|t| t.as_second()).unwrap_or(i64::MIN);
        let det = detection_cutoff.map(|t| t.as_second()).unwrap_or(i64::MIN);
        raw::recordings_for_retention(&self.conn, name, reg, det, limit)
    }

    /// Up to `limit` unprotected recordings of `name` whose age exceeds the
    /// per-tier horizon, oldest first.
    pub fn recordings_for_tiered_retention(
        &self,
        name: &str,
        cutoffs: &[jiff::Timestamp; 4],
        limit: usize,
    ) -> Result<Vec<Recording>, Error> {
        let cutoffs = [
            cutoffs[0].as_second(),
            cutoffs[1].as_second(),
            cutoffs[2].as_second(),
            cutoffs[3].as_second(),
        ];
        raw::recordings_for_tiered_retention(&self.conn, name, &cutoffs, limit)
    }

    /// Up to `limit` unprotected recordings of `name`, oldest first, for
    /// quota enforcement.
    pub fn recordings_for_quota(&self, name: &str, limit: usize) -> Result<Vec<Recording>, Error> {
        raw::recordings_for_quota(&self.conn, name, limit)
    }

    /// Up to `limit` unprotected recordings across all streams, most
    /// expendable first: ephemeral tier before standard before important
    /// before critical, oldest first within a tier.
    pub fn recordings_for_pressure(&self, limit: usize) -> Result<Vec<Recording>, Error> {
        raw::recordings_for_pressure(&self.conn, limit)
    }

    /// Up to `limit` rows whose file is missing on disk, along with the total
    /// number of rows examined. Note this does file I/O under the lock.
    pub fn orphaned_recordings(&self, limit: usize) -> Result<(Vec<Recording>, usize), Error> {
        raw::orphaned_recordings(&self.conn, limit)
    }

    /// Total bytes of recordings for the given stream, from SQL (not the
    /// summary cache).
    pub fn stream_storage_bytes(&self, name: &str) -> Result<u64, Error> {
        raw::stream_storage_bytes(&self.conn, name)
    }

    /// Cached summary for the given stream, if it has any recordings and a
    /// cleanup cycle has run since they changed.
    pub fn storage_summary(&self, name: &str) -> Option<&StorageSummary> {
        self.storage_summaries.get(name)
    }

    /// Rebuilds the in-memory per-stream summaries from SQL.
    pub fn refresh_storage_summaries(&mut self) -> Result<(), Error> {
        self.storage_summaries = raw::storage_summaries(&self.conn)?;
        Ok(())
    }

    pub fn insert_detection(&mut self, stream_name: &str, d: &Detection) -> Result<(), Error> {
        raw::insert_detection(&self.conn, stream_name, d)
    }

    /// Detections for `stream_name` with `timestamp >= cutoff`, oldest first.
    pub fn detections_since(
        &self,
        stream_name: &str,
        cutoff: jiff::Timestamp,
    ) -> Result<Vec<Detection>, Error> {
        raw::detections_since(&self.conn, stream_name, cutoff.as_second())
    }

    pub fn delete_detections_before(
        &mut self,
        stream_name: &str,
        cutoff: jiff::Timestamp,
    ) -> Result<usize, Error> {
        raw::delete_detections_before(&self.conn, stream_name, cutoff.as_second())
    }

    pub fn zones(&self, stream_name: &str) -> Result<Vec<Zone>, Error> {
        raw::zones(&self.conn, stream_name)
    }

    pub fn upsert_zone(&mut self, stream_name: &str, z: &Zone) -> Result<i64, Error> {
        if z.points.len() < 3 {
            bail!(
                InvalidArgument,
                msg("zone {} needs at least 3 points", z.name)
            );
        }
        raw::upsert_zone(&self.conn, stream_name, z)
    }

    pub fn insert_thumbnail(&mut self, recording_id: i64, path: &Path) -> Result<i64, Error> {
        raw::insert_thumbnail(&self.conn, recording_id, path)
    }

    pub fn thumbnails_for_recording(&self, recording_id: i64) -> Result<Vec<PathBuf>, Error> {
        raw::thumbnails_for_recording(&self.conn, recording_id)
    }

    pub fn insert_session(
        &mut self,
        created_at: jiff::Timestamp,
        expires_at: jiff::Timestamp,
    ) -> Result<i64, Error> {
        raw::insert_session(&self.conn, created_at.as_second(), expires_at.as_second())
    }

    pub fn delete_expired_sessions(&mut self, now: jiff::Timestamp) -> Result<usize, Error> {
        raw::delete_expired_sessions(&self.conn, now.as_second())
    }
}

static INTEGRITY_PRAGMAS: [&str; 3] = [
    "pragma foreign_keys = on",
    "pragma fullfsync = on",
    "pragma synchronous = 2",
];

/// Sets pragmas for full database integrity.
pub(crate) fn set_integrity_pragmas(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    for pragma in INTEGRITY_PRAGMAS {
        conn.execute(pragma, params![])?;
    }
    Ok(())
}

pub(crate) fn check_sqlite_version() -> Result<(), Error> {
    // SQLite version 3.8.2 introduced the "without rowid" syntax; treat it as
    // the oldest version worth supporting.
    if rusqlite::version_number() < 3008002 {
        bail!(
            FailedPrecondition,
            msg(
                "SQLite version {} is too old; need at least 3.8.2",
                rusqlite::version()
            )
        );
    }
    Ok(())
}

/// Initializes a database.
/// Note this doesn't set journal options, so that it can be used on in-memory
/// databases for test code.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    check_sqlite_version()?;
    set_integrity_pragmas(conn)?;
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))
        .map_err(|e| err!(Internal, msg("unable to create database schema"), source(e)))?;
    tx.execute(
        "insert into meta (config) values (?)",
        params![GlobalConfig::default()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Gets the schema version from the given database connection.
/// A fully initialized database will return `Ok(Some(schema_version))`. An
/// empty database will return `Ok(None)`. A partially initialized database
/// (in particular, one without a version row) will return some error.
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let ver_tables: i32 = conn.query_row_and_then(
        "select count(*) from sqlite_master where name = 'version'",
        params![],
        |row| row.get(0),
    )?;
    if ver_tables == 0 {
        return Ok(None);
    }
    Ok(Some(conn.query_row_and_then(
        "select max(id) from version",
        params![],
        |row| row.get(0),
    )?))
}

/// Checks that the schema version in the given database is as expected.
pub(crate) fn check_schema_version(conn: &rusqlite::Connection) -> Result<(), Error> {
    let Some(ver) = get_schema_version(conn)? else {
        bail!(
            FailedPrecondition,
            msg("no such table: version; use `lightnvr init` to create a fresh database")
        )
    };
    match ver.cmp(&EXPECTED_SCHEMA_VERSION) {
        std::cmp::Ordering::Less => bail!(
            FailedPrecondition,
            msg(
                "database schema version {ver} is too old (expected \
                {EXPECTED_SCHEMA_VERSION}); run `lightnvr upgrade`"
            )
        ),
        std::cmp::Ordering::Equal => Ok(()),
        std::cmp::Ordering::Greater => bail!(
            FailedPrecondition,
            msg(
                "database schema version {ver} is too new (expected \
                {EXPECTED_SCHEMA_VERSION}); must use a newer binary to match"
            )
        ),
    }
}

/// The metadata database. Abstracts away SQLite queries and maintains
/// in-memory state (loaded on startup, updated on successful writes).
pub struct Database<C: Clocks + Clone = clock::RealClocks> {
    /// This is wrapped in an `Option` to allow the `Drop` implementation and
    /// `close` to coexist.
    db: Option<Mutex<LockedDatabase>>,

    /// This is kept separately from the `LockedDatabase` to allow the
    /// `lock()` operation itself to access it. It doesn't need a `Mutex`
    /// anyway; it's `Sync`, and all operations work on `&self`.
    clocks: C,
}

impl<C: Clocks + Clone> std::fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// Helpers for Database::lock(). Closures don't implement Fn.
fn acquisition() -> &'static str {
    "database lock acquisition"
}
fn operation() -> &'static str {
    "database operation"
}

impl<C: Clocks + Clone> Database<C> {
    /// Creates the database from a caller-supplied SQLite connection.
    pub fn new(clocks: C, mut conn: rusqlite::Connection) -> Result<Database<C>, Error> {
        check_sqlite_version()?;
        set_integrity_pragmas(&mut conn)?;
        check_schema_version(&conn)?;
        let global = raw::read_meta(&conn)?;
        let streams_by_name = raw::list_streams(&conn)?;
        let storage_summaries = raw::storage_summaries(&conn)?;
        info!(
            streams = streams_by_name.len(),
            "loaded stream configurations"
        );
        Ok(Database {
            db: Some(Mutex::new(LockedDatabase {
                conn,
                global,
                streams_by_name,
                storage_summaries,
            })),
            clocks,
        })
    }

    #[inline(always)]
    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    /// Locks the database; the returned reference is the only way to perform
    /// (read or write) operations.
    pub fn lock(&self) -> DatabaseGuard<'_, C> {
        let timer = clock::TimerGuard::new(&self.clocks, acquisition);
        let db = self
            .db
            .as_ref()
            .expect("db is present until drop")
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(timer);
        let _timer = clock::TimerGuard::<C, &'static str, fn() -> &'static str>::new(
            &self.clocks,
            operation,
        );
        DatabaseGuard { db, _timer }
    }

    /// For testing: closes the database and returns the connection.
    /// This allows verification that a newly opened database is in an
    /// acceptable state.
    #[cfg(test)]
    fn close(mut self) -> rusqlite::Connection {
        self.db
            .take()
            .unwrap()
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .conn
    }
}

/// Reference to a locked database returned by [`Database::lock`].
pub struct DatabaseGuard<'db, C: Clocks> {
    db: MutexGuard<'db, LockedDatabase>,
    _timer: clock::TimerGuard<'db, C, &'static str, fn() -> &'static str>,
}

impl<'db, C: Clocks + Clone> std::ops::Deref for DatabaseGuard<'db, C> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.db
    }
}

impl<'db, C: Clocks + Clone> std::ops::DerefMut for DatabaseGuard<'db, C> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::clock::SimulatedClocks;
    use base::ErrorKind;

    fn setup_conn() -> rusqlite::Connection {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        init(&mut conn).unwrap();
        conn
    }

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap())
    }

    fn ts(s: &str) -> jiff::Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn version_roundtrip() {
        testutil::init();
        let conn = setup_conn();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(EXPECTED_SCHEMA_VERSION));
        check_schema_version(&conn).unwrap();
    }

    #[test]
    fn open_empty_fails() {
        testutil::init();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let e = Database::new(clocks(), conn).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn stream_config_roundtrip() {
        testutil::init();
        let db = Database::new(clocks(), setup_conn()).unwrap();
        {
            let mut l = db.lock();
            let mut cfg = StreamConfig::default();
            cfg.record = true;
            cfg.retention_days = 7;
            l.upsert_stream("front_door", cfg.clone()).unwrap();
            assert_eq!(l.get_stream("front_door"), Some(&cfg));
            cfg.record = false;
            l.upsert_stream("front_door", cfg.clone()).unwrap();
            assert_eq!(l.get_stream("front_door"), Some(&cfg));
        }

        // The row should survive reopening.
        let conn = db.close();
        let db = Database::new(clocks(), conn).unwrap();
        let l = db.lock();
        assert!(l.get_stream("front_door").is_some());
        assert_eq!(l.streams().len(), 1);
    }

    #[test]
    fn stream_name_validation() {
        testutil::init();
        let db = Database::new(clocks(), setup_conn()).unwrap();
        let mut l = db.lock();
        l.upsert_stream("", StreamConfig::default()).unwrap_err();
        l.upsert_stream("a/b", StreamConfig::default()).unwrap_err();
        l.upsert_stream(&"x".repeat(64), StreamConfig::default())
            .unwrap_err();
        l.upsert_stream(&"x".repeat(63), StreamConfig::default())
            .unwrap();
    }

    #[test]
    fn delete_missing_stream() {
        testutil::init();
        let db = Database::new(clocks(), setup_conn()).unwrap();
        let e = db.lock().delete_stream("nope").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn effective_retention_defaults() {
        let cfg = StreamConfig::default();
        let p = RetentionPolicy::effective(&cfg, 30);
        assert_eq!(p.retention_days, 30);
        assert_eq!(p.detection_retention_days, 90);
        assert!(!p.is_noop());

        let p = RetentionPolicy::effective(&cfg, 0);
        assert_eq!(p.retention_days, 0);
        assert_eq!(p.detection_retention_days, 0);
        assert!(p.is_noop());

        let mut cfg = StreamConfig::default();
        cfg.retention_days = 7;
        cfg.detection_retention_days = 2;
        let p = RetentionPolicy::effective(&cfg, 30);
        assert_eq!(p.retention_days, 7);
        assert_eq!(p.detection_retention_days, 2);
    }

    #[test]
    fn retention_query_excludes_protected_and_sorts() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let old = ts("2026-01-01T00:00:00Z");
        let older = ts("2025-12-01T00:00:00Z");
        let new = ts("2026-02-27T00:00:00Z");
        tdb.insert_recording_at(testutil::TEST_STREAM, old, 1 << 20, false);
        tdb.insert_recording_at(testutil::TEST_STREAM, older, 1 << 20, false);
        tdb.insert_recording_at(testutil::TEST_STREAM, old, 1 << 20, true); // protected
        tdb.insert_recording_at(testutil::TEST_STREAM, new, 1 << 20, false);

        let l = tdb.db.lock();
        let got = l
            .recordings_for_retention(
                testutil::TEST_STREAM,
                Some(ts("2026-02-01T00:00:00Z")),
                Some(ts("2026-02-01T00:00:00Z")),
                100,
            )
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].created_at, older);
        assert_eq!(got[1].created_at, old);
        assert!(got.iter().all(|r| !r.protected));
    }

    #[test]
    fn retention_query_none_cutoff_matches_nothing() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        tdb.insert_recording_at(testutil::TEST_STREAM, ts("2020-01-01T00:00:00Z"), 1, false);
        let l = tdb.db.lock();
        let got = l
            .recordings_for_retention(testutil::TEST_STREAM, None, None, 100)
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn pressure_query_orders_by_tier_then_age() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let t0 = ts("2026-01-01T00:00:00Z");
        let t1 = ts("2026-01-02T00:00:00Z");
        let mk = |when, tier, protected| {
            tdb.insert_recording_with(testutil::TEST_STREAM, when, 1, TriggerType::Continuous, tier, protected)
        };
        mk(t0, RetentionTier::Critical, false);
        mk(t1, RetentionTier::Ephemeral, false);
        mk(t0, RetentionTier::Ephemeral, false);
        mk(t0, RetentionTier::Ephemeral, true); // protected: excluded
        mk(t0, RetentionTier::Standard, false);

        let l = tdb.db.lock();
        let got = l.recordings_for_pressure(10).unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].tier, RetentionTier::Ephemeral);
        assert_eq!(got[0].created_at, t0);
        assert_eq!(got[1].tier, RetentionTier::Ephemeral);
        assert_eq!(got[1].created_at, t1);
        assert_eq!(got[2].tier, RetentionTier::Standard);
        assert_eq!(got[3].tier, RetentionTier::Critical);
    }

    #[test]
    fn orphan_scan_counts_and_limits() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let t = ts("2026-01-01T00:00:00Z");
        // Two real files, one missing.
        tdb.insert_recording_at(testutil::TEST_STREAM, t, 1, false);
        tdb.insert_recording_at(testutil::TEST_STREAM, t, 1, false);
        let orphan_id = {
            let mut l = tdb.db.lock();
            l.insert_recording(&RecordingToInsert {
                stream_name: testutil::TEST_STREAM.to_owned(),
                file_path: tdb.tmpdir.path().join("missing.mp4"),
                size_bytes: 1,
                created_at: t,
                trigger: TriggerType::Continuous,
                tier: RetentionTier::Standard,
                protected: false,
            })
            .unwrap()
        };
        let l = tdb.db.lock();
        let (orphans, checked) = l.orphaned_recordings(100).unwrap();
        assert_eq!(checked, 3);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan_id);
    }

    #[test]
    fn storage_summaries_refresh() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let t0 = ts("2026-01-01T00:00:00Z");
        let t1 = ts("2026-01-05T00:00:00Z");
        tdb.insert_recording_at(testutil::TEST_STREAM, t0, 100, false);
        tdb.insert_recording_at(testutil::TEST_STREAM, t1, 200, false);
        let mut l = tdb.db.lock();
        l.refresh_storage_summaries().unwrap();
        let s = l.storage_summary(testutil::TEST_STREAM).unwrap();
        assert_eq!(s.total_bytes, 300);
        assert_eq!(s.latest_recording, Some(t1));
        assert_eq!(l.stream_storage_bytes(testutil::TEST_STREAM).unwrap(), 300);
    }

    #[test]
    fn detections_window() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let mut l = tdb.db.lock();
        for (t, conf) in [("2026-03-01T00:00:00Z", 0.9), ("2026-03-01T00:10:00Z", 0.4)] {
            l.insert_detection(
                testutil::TEST_STREAM,
                &Detection {
                    timestamp: ts(t),
                    label: "person".to_owned(),
                    confidence: conf,
                    x: 0.1,
                    y: 0.1,
                    w: 0.2,
                    h: 0.4,
                    zone_id: None,
                },
            )
            .unwrap();
        }
        let got = l
            .detections_since(testutil::TEST_STREAM, ts("2026-03-01T00:05:00Z"))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].confidence, 0.4);
        assert_eq!(
            l.delete_detections_before(testutil::TEST_STREAM, ts("2026-03-01T00:05:00Z"))
                .unwrap(),
            1
        );
    }

    #[test]
    fn zone_roundtrip() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let mut l = tdb.db.lock();
        let mut z = Zone {
            id: 0,
            name: "driveway".to_owned(),
            enabled: true,
            points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            classes: vec!["person".to_owned(), "car".to_owned()],
            min_confidence: 0.25,
        };
        let id = l.upsert_zone(testutil::TEST_STREAM, &z).unwrap();
        z.id = id;
        assert_eq!(l.zones(testutil::TEST_STREAM).unwrap(), vec![z.clone()]);

        z.enabled = false;
        l.upsert_zone(testutil::TEST_STREAM, &z).unwrap();
        assert_eq!(l.zones(testutil::TEST_STREAM).unwrap()[0].enabled, false);

        z.points.truncate(2);
        l.upsert_zone(testutil::TEST_STREAM, &z).unwrap_err();
    }

    #[test]
    fn sessions_reaped() {
        testutil::init();
        let tdb = testutil::TestDb::new(clocks());
        let mut l = tdb.db.lock();
        l.insert_session(ts("2026-02-01T00:00:00Z"), ts("2026-02-02T00:00:00Z"))
            .unwrap();
        l.insert_session(ts("2026-02-01T00:00:00Z"), ts("2026-04-01T00:00:00Z"))
            .unwrap();
        assert_eq!(l.delete_expired_sessions(ts("2026-03-01T00:00:00Z")).unwrap(), 1);
        assert_eq!(l.delete_expired_sessions(ts("2026-03-01T00:00:00Z")).unwrap(), 0);
    }
}
