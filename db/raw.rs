// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.

use crate::db::{Detection, Recording, RecordingToInsert, StorageSummary, Zone};
use crate::json::{GlobalConfig, StreamConfig};
use base::Error;
use base::{err, ErrorKind, FastHashMap, ResultExt as _};
use rusqlite::{named_params, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// Note: `trigger_type = 2` below selects detection-triggered recordings; see
// `TriggerType` in db.rs for the mapping.
const LIST_RECORDINGS_FOR_RETENTION_SQL: &str = r#"
    select
      id, stream_name, file_path, size_bytes, created_at,
      trigger_type, retention_tier, protected
    from
      recording
    where
      stream_name = :stream_name and
      protected = 0 and
      ((trigger_type = 2 and created_at < :detection_cutoff) or
       (trigger_type != 2 and created_at < :regular_cutoff))
    order by created_at
    limit :limit
"#;

const LIST_RECORDINGS_FOR_TIERED_RETENTION_SQL: &str = r#"
    select
      id, stream_name, file_path, size_bytes, created_at,
      trigger_type, retention_tier, protected
    from
      recording
    where
      stream_name = :stream_name and
      protected = 0 and
      created_at < case retention_tier
        when 0 then :critical_cutoff
        when 1 then :important_cutoff
        when 2 then :standard_cutoff
        else :ephemeral_cutoff
      end
    order by created_at
    limit :limit
"#;

const LIST_RECORDINGS_FOR_QUOTA_SQL: &str = r#"
    select
      id, stream_name, file_path, size_bytes, created_at,
      trigger_type, retention_tier, protected
    from
      recording
    where
      stream_name = :stream_name and
      protected = 0
    order by created_at
    limit :limit
"#;

// Ephemeral recordings (tier 3) go first, then downward in tier, oldest first
// within a tier.
const LIST_RECORDINGS_FOR_PRESSURE_SQL: &str = r#"
    select
      id, stream_name, file_path, size_bytes, created_at,
      trigger_type, retention_tier, protected
    from
      recording
    where
      protected = 0
    order by retention_tier desc, created_at
    limit :limit
"#;

const LIST_ALL_RECORDINGS_SQL: &str = r#"
    select
      id, stream_name, file_path, size_bytes, created_at,
      trigger_type, retention_tier, protected
    from
      recording
    order by id
"#;

const STORAGE_SUMMARIES_SQL: &str = r#"
    select
      stream_name,
      sum(size_bytes),
      max(created_at)
    from
      recording
    group by stream_name
"#;

fn recording_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: PathBuf::from(row.get::<_, String>(2)?),
        size_bytes: row.get(3)?,
        created_at: timestamp_from_column(row, 4)?,
        trigger: row.get(5)?,
        tier: row.get(6)?,
        protected: row.get(7)?,
    })
}

fn timestamp_from_column(row: &rusqlite::Row, i: usize) -> rusqlite::Result<jiff::Timestamp> {
    let secs: i64 = row.get(i)?;
    jiff::Timestamp::from_second(secs).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn list_recordings(mut rows: rusqlite::Rows) -> Result<Vec<Recording>, Error> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(recording_from_row(row).err_kind(ErrorKind::Internal)?);
    }
    Ok(out)
}

pub(crate) fn read_meta(conn: &rusqlite::Connection) -> Result<GlobalConfig, Error> {
    conn.query_row("select config from meta", params![], |row| row.get(0))
        .map_err(Error::from)
}

pub(crate) fn write_meta(conn: &rusqlite::Connection, config: &GlobalConfig) -> Result<(), Error> {
    conn.execute("update meta set config = ?", params![config])?;
    Ok(())
}

pub(crate) fn list_streams(
    conn: &rusqlite::Connection,
) -> Result<BTreeMap<String, StreamConfig>, Error> {
    let mut stmt = conn
        .prepare("select name, config from stream")
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
    let mut out = BTreeMap::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let name: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let config: StreamConfig = row.get(1).err_kind(ErrorKind::Internal)?;
        out.insert(name, config);
    }
    Ok(out)
}

pub(crate) fn upsert_stream(
    conn: &rusqlite::Connection,
    name: &str,
    config: &StreamConfig,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into stream (name, config) values (:name, :config)
            on conflict (name) do update set config = :config
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {":name": name, ":config": config})
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn delete_stream(conn: &rusqlite::Connection, name: &str) -> Result<bool, Error> {
    let n = conn
        .execute("delete from stream where name = ?", params![name])
        .err_kind(ErrorKind::Internal)?;
    Ok(n > 0)
}

pub(crate) fn insert_recording(
    conn: &rusqlite::Connection,
    r: &RecordingToInsert,
) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into recording (stream_name,  file_path,  size_bytes,  created_at,
                                   trigger_type, retention_tier, protected)
                           values (:stream_name, :file_path, :size_bytes, :created_at,
                                   :trigger_type, :retention_tier, :protected)
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream_name": r.stream_name,
        ":file_path": r.file_path.to_string_lossy(),
        ":size_bytes": r.size_bytes,
        ":created_at": r.created_at.as_second(),
        ":trigger_type": r.trigger,
        ":retention_tier": r.tier,
        ":protected": r.protected,
    })
    .map_err(|e| err!(Internal, msg("unable to insert recording {:?}", r.file_path), source(e)))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn finalize_recording(
    conn: &rusqlite::Connection,
    id: i64,
    size_bytes: i64,
) -> Result<(), Error> {
    let n = conn
        .execute(
            "update recording set size_bytes = ? where id = ?",
            params![size_bytes, id],
        )
        .err_kind(ErrorKind::Internal)?;
    if n != 1 {
        // The row can be deleted out from under a writer by the retention
        // engine; surface it as NotFound rather than corrupting anything.
        return Err(err!(NotFound, msg("no recording {id}")));
    }
    Ok(())
}

pub(crate) fn set_recording_protected(
    conn: &rusqlite::Connection,
    id: i64,
    protected: bool,
) -> Result<(), Error> {
    let n = conn
        .execute(
            "update recording set protected = ? where id = ?",
            params![protected, id],
        )
        .err_kind(ErrorKind::Internal)?;
    if n != 1 {
        return Err(err!(NotFound, msg("no recording {id}")));
    }
    Ok(())
}

/// Deletes the metadata row for a recording, along with its thumbnail rows.
/// The files must already be (or be about to be) unlinked by the caller.
pub(crate) fn delete_recording(conn: &rusqlite::Connection, id: i64) -> Result<(), Error> {
    conn.execute("delete from thumbnail where recording_id = ?", params![id])
        .err_kind(ErrorKind::Internal)?;
    let n = conn
        .execute("delete from recording where id = ?", params![id])
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no recording {id}")));
    }
    Ok(())
}

pub(crate) fn recording_by_path(
    conn: &rusqlite::Connection,
    path: &Path,
) -> Result<Option<Recording>, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            select
              id, stream_name, file_path, size_bytes, created_at,
              trigger_type, retention_tier, protected
            from recording where file_path = ?
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(params![path.to_string_lossy()])
        .err_kind(ErrorKind::Internal)?;
    match rows.next().err_kind(ErrorKind::Internal)? {
        Some(row) => Ok(Some(recording_from_row(row).err_kind(ErrorKind::Internal)?)),
        None => Ok(None),
    }
}

pub(crate) fn recordings_for_retention(
    conn: &rusqlite::Connection,
    stream_name: &str,
    regular_cutoff: i64,
    detection_cutoff: i64,
    limit: usize,
) -> Result<Vec<Recording>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_RECORDINGS_FOR_RETENTION_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query(named_params! {
            ":stream_name": stream_name,
            ":regular_cutoff": regular_cutoff,
            ":detection_cutoff": detection_cutoff,
            ":limit": limit as i64,
        })
        .err_kind(ErrorKind::Internal)?;
    list_recordings(rows)
}

pub(crate) fn recordings_for_tiered_retention(
    conn: &rusqlite::Connection,
    stream_name: &str,
    cutoffs: &[i64; 4],
    limit: usize,
) -> Result<Vec<Recording>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_RECORDINGS_FOR_TIERED_RETENTION_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query(named_params! {
            ":stream_name": stream_name,
            ":critical_cutoff": cutoffs[0],
            ":important_cutoff": cutoffs[1],
            ":standard_cutoff": cutoffs[2],
            ":ephemeral_cutoff": cutoffs[3],
            ":limit": limit as i64,
        })
        .err_kind(ErrorKind::Internal)?;
    list_recordings(rows)
}

pub(crate) fn recordings_for_quota(
    conn: &rusqlite::Connection,
    stream_name: &str,
    limit: usize,
) -> Result<Vec<Recording>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_RECORDINGS_FOR_QUOTA_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query(named_params! {":stream_name": stream_name, ":limit": limit as i64})
        .err_kind(ErrorKind::Internal)?;
    list_recordings(rows)
}

pub(crate) fn recordings_for_pressure(
    conn: &rusqlite::Connection,
    limit: usize,
) -> Result<Vec<Recording>, Error> {
    let mut stmt = conn
        .prepare_cached(LIST_RECORDINGS_FOR_PRESSURE_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query(named_params! {":limit": limit as i64})
        .err_kind(ErrorKind::Internal)?;
    list_recordings(rows)
}

/// Scans recording rows in id order, returning up to `limit` whose
/// `file_path` no longer exists on disk, along with the number of rows
/// examined.
pub(crate) fn orphaned_recordings(
    conn: &rusqlite::Connection,
    limit: usize,
) -> Result<(Vec<Recording>, usize), Error> {
    let mut stmt = conn
        .prepare_cached(LIST_ALL_RECORDINGS_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
    let mut orphans = Vec::new();
    let mut checked = 0;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let r = recording_from_row(row).err_kind(ErrorKind::Internal)?;
        checked += 1;
        // Protected rows are never candidates, even when their file is gone.
        if !r.protected && !r.file_path.exists() {
            orphans.push(r);
            if orphans.len() >= limit {
                break;
            }
        }
    }
    Ok((orphans, checked))
}

pub(crate) fn stream_storage_bytes(
    conn: &rusqlite::Connection,
    stream_name: &str,
) -> Result<u64, Error> {
    let bytes: i64 = conn
        .query_row(
            "select coalesce(sum(size_bytes), 0) from recording where stream_name = ?",
            params![stream_name],
            |row| row.get(0),
        )
        .err_kind(ErrorKind::Internal)?;
    Ok(bytes.max(0) as u64)
}

pub(crate) fn storage_summaries(
    conn: &rusqlite::Connection,
) -> Result<FastHashMap<String, StorageSummary>, Error> {
    let mut stmt = conn
        .prepare_cached(STORAGE_SUMMARIES_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
    let mut out = FastHashMap::default();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let name: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let total: i64 = row.get(1).err_kind(ErrorKind::Internal)?;
        let latest = timestamp_from_column(row, 2).err_kind(ErrorKind::Internal)?;
        out.insert(
            name,
            StorageSummary {
                total_bytes: total.max(0) as u64,
                latest_recording: Some(latest),
            },
        );
    }
    Ok(out)
}

pub(crate) fn insert_detection(
    conn: &rusqlite::Connection,
    stream_name: &str,
    d: &Detection,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            insert into detection (stream_name,  timestamp,  label,  confidence,
                                   x,  y,  w,  h,  zone_id)
                           values (:stream_name, :timestamp, :label, :confidence,
                                   :x, :y, :w, :h, :zone_id)
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream_name": stream_name,
        ":timestamp": d.timestamp.as_second(),
        ":label": d.label,
        ":confidence": d.confidence,
        ":x": d.x,
        ":y": d.y,
        ":w": d.w,
        ":h": d.h,
        ":zone_id": d.zone_id,
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn detections_since(
    conn: &rusqlite::Connection,
    stream_name: &str,
    cutoff: i64,
) -> Result<Vec<Detection>, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            select
              timestamp, label, confidence, x, y, w, h, zone_id
            from
              detection
            where
              stream_name = :stream_name and
              timestamp >= :cutoff
            order by timestamp
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {":stream_name": stream_name, ":cutoff": cutoff})
        .err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(Detection {
            timestamp: timestamp_from_column(row, 0).err_kind(ErrorKind::Internal)?,
            label: row.get(1).err_kind(ErrorKind::Internal)?,
            confidence: row.get(2).err_kind(ErrorKind::Internal)?,
            x: row.get(3).err_kind(ErrorKind::Internal)?,
            y: row.get(4).err_kind(ErrorKind::Internal)?,
            w: row.get(5).err_kind(ErrorKind::Internal)?,
            h: row.get(6).err_kind(ErrorKind::Internal)?,
            zone_id: row.get(7).err_kind(ErrorKind::Internal)?,
        });
    }
    Ok(out)
}

pub(crate) fn delete_detections_before(
    conn: &rusqlite::Connection,
    stream_name: &str,
    cutoff: i64,
) -> Result<usize, Error> {
    conn.execute(
        "delete from detection where stream_name = ? and timestamp < ?",
        params![stream_name, cutoff],
    )
    .err_kind(ErrorKind::Internal)
}

pub(crate) fn zones(conn: &rusqlite::Connection, stream_name: &str) -> Result<Vec<Zone>, Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            select
              id, name, enabled, points, class_list, min_confidence
            from
              zone
            where
              stream_name = ?
            order by id
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![stream_name]).err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let points_json: String = row.get(3).err_kind(ErrorKind::Internal)?;
        let points: Vec<[f64; 2]> = serde_json::from_str(&points_json)
            .map_err(|e| err!(DataLoss, msg("bad zone points"), source(e)))?;
        let class_list: String = row.get(4).err_kind(ErrorKind::Internal)?;
        out.push(Zone {
            id: row.get(0).err_kind(ErrorKind::Internal)?,
            name: row.get(1).err_kind(ErrorKind::Internal)?,
            enabled: row.get(2).err_kind(ErrorKind::Internal)?,
            points,
            classes: class_list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            min_confidence: row.get(5).err_kind(ErrorKind::Internal)?,
        });
    }
    Ok(out)
}

pub(crate) fn upsert_zone(
    conn: &rusqlite::Connection,
    stream_name: &str,
    z: &Zone,
) -> Result<i64, Error> {
    let points = serde_json::to_string(&z.points).err_kind(ErrorKind::Internal)?;
    let class_list = z.classes.join(",");
    if z.id != 0 {
        let n = conn
            .execute(
                r#"
                update zone set name = ?, enabled = ?, points = ?, class_list = ?,
                                min_confidence = ?
                where id = ? and stream_name = ?
                "#,
                params![z.name, z.enabled, points, class_list, z.min_confidence, z.id, stream_name],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            return Err(err!(NotFound, msg("no zone {} for stream {stream_name}", z.id)));
        }
        return Ok(z.id);
    }
    conn.execute(
        r#"
        insert into zone (stream_name, name, enabled, points, class_list, min_confidence)
                  values (?, ?, ?, ?, ?, ?)
        "#,
        params![stream_name, z.name, z.enabled, points, class_list, z.min_confidence],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_thumbnail(
    conn: &rusqlite::Connection,
    recording_id: i64,
    path: &Path,
) -> Result<i64, Error> {
    conn.execute(
        "insert into thumbnail (recording_id, file_path) values (?, ?)",
        params![recording_id, path.to_string_lossy()],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn thumbnails_for_recording(
    conn: &rusqlite::Connection,
    recording_id: i64,
) -> Result<Vec<PathBuf>, Error> {
    let mut stmt = conn
        .prepare_cached("select file_path from thumbnail where recording_id = ?")
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(params![recording_id]).err_kind(ErrorKind::Internal)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        out.push(PathBuf::from(row.get::<_, String>(0).err_kind(ErrorKind::Internal)?));
    }
    Ok(out)
}

pub(crate) fn insert_session(
    conn: &rusqlite::Connection,
    created_at: i64,
    expires_at: i64,
) -> Result<i64, Error> {
    conn.execute(
        "insert into session (created_at, expires_at) values (?, ?)",
        params![created_at, expires_at],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn delete_expired_sessions(
    conn: &rusqlite::Connection,
    now: i64,
) -> Result<usize, Error> {
    conn.execute("delete from session where expires_at < ?", params![now])
        .err_kind(ErrorKind::Internal)
}
