// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the database schema.

use crate::db;
use base::{bail, Error};
use rusqlite::params;
use tracing::info;

mod v0_to_v1;

const UPGRADE_NOTES: &str = concat!("upgraded using lightnvr-db ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default)]
pub struct Args<'a> {
    pub preset_journal: &'a str,
    pub no_vacuum: bool,
}

fn set_journal_mode(conn: &rusqlite::Connection, requested: &str) -> Result<(), Error> {
    assert!(!requested.contains(';')); // quick check for accidental sql injection.
    let actual = conn.query_row(
        &format!("pragma journal_mode = {requested}"),
        params![],
        |row| row.get::<_, String>(0),
    )?;
    info!("...database now in journal_mode {actual} (requested {requested}).");
    Ok(())
}

fn upgrade(_args: &Args, target_ver: i32, conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let upgraders = [v0_to_v1::run];

    {
        assert_eq!(upgraders.len(), db::EXPECTED_SCHEMA_VERSION as usize);
        let old_ver: i32 =
            conn.query_row("select max(id) from version", params![], |row| row.get(0))?;
        if old_ver > db::EXPECTED_SCHEMA_VERSION {
            bail!(
                FailedPrecondition,
                msg(
                    "database is at version {old_ver}, later than expected {}",
                    db::EXPECTED_SCHEMA_VERSION
                )
            );
        } else if old_ver < 0 {
            bail!(OutOfRange, msg("database is at negative version {old_ver}!"));
        }
        info!("upgrading database from version {old_ver} to version {target_ver}...");
        for ver in old_ver..target_ver {
            info!("...from version {ver} to version {}", ver + 1);
            let tx = conn.transaction()?;
            upgraders[ver as usize](&tx)?;
            tx.execute(
                r#"
                insert into version (id, unix_time, notes)
                             values (?, cast(strftime('%s', 'now') as int), ?)
                "#,
                params![ver + 1, UPGRADE_NOTES],
            )?;
            tx.commit()?;
        }
    }

    Ok(())
}

pub fn run(args: &Args, conn: &mut rusqlite::Connection) -> Result<(), Error> {
    db::check_sqlite_version()?;
    db::set_integrity_pragmas(conn)?;
    set_journal_mode(conn, args.preset_journal)?;
    upgrade(args, db::EXPECTED_SCHEMA_VERSION, conn)?;

    // Try for page_size=16384 and wal. Do the vacuum prior to switching back
    // to WAL: page_size only takes effect on a vacuum in non-WAL mode
    // (https://www.sqlite.org/pragma.html#pragma_page_size), and on old
    // versions of SQLite3 a huge transaction is best done in non-WAL mode.
    if !args.no_vacuum {
        info!("...vacuuming database after upgrade.");
        conn.execute_batch(
            r#"
            pragma page_size = 16384;
            vacuum;
            "#,
        )?;
    }

    set_journal_mode(conn, "wal")?;
    info!("...done.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    /// The version 0 schema, as shipped before the tiered retention engine.
    const V0_SQL: &str = r#"
        create table meta (config text not null);
        create table version (id integer primary key, unix_time integer not null, notes text);
        create table stream (
          id integer primary key,
          name text unique not null,
          config text
        );
        create table recording (
          id integer primary key,
          stream_name text not null,
          file_path text unique not null,
          size_bytes integer not null default 0,
          created_at integer not null,
          trigger_type integer not null
        );
        create index recording_stream_created on recording (stream_name, created_at);
        create table detection (
          id integer primary key,
          stream_name text not null,
          timestamp integer not null,
          label text not null,
          confidence real not null,
          x real not null,
          y real not null,
          w real not null,
          h real not null,
          zone_id integer
        );
        create index detection_stream_time on detection (stream_name, timestamp);
        create table zone (
          id integer primary key,
          stream_name text not null,
          name text not null,
          enabled integer not null default 1,
          points text not null,
          class_list text not null default '',
          min_confidence real not null default 0
        );
        create table session (
          id integer primary key,
          created_at integer not null,
          expires_at integer not null
        );
        insert into meta (config) values ('{}');
        insert into version (id, unix_time, notes)
                    values (0, cast(strftime('%s', 'now') as int), 'init');
    "#;

    fn new_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute("pragma foreign_keys = on", params![]).unwrap();
        conn
    }

    #[test]
    fn upgrade_from_v0() {
        testutil::init();
        let mut conn = new_conn();
        conn.execute_batch(V0_SQL).unwrap();
        conn.execute_batch(
            r#"
            insert into recording (stream_name, file_path, size_bytes, created_at, trigger_type)
                           values ('cam1', '/var/lib/lightnvr/recordings/cam1/a.mp4', 42, 1700000000, 0);
            "#,
        )
        .unwrap();

        upgrade(
            &Args {
                preset_journal: "delete",
                no_vacuum: true,
            },
            db::EXPECTED_SCHEMA_VERSION,
            &mut conn,
        )
        .unwrap();

        assert_eq!(
            db::get_schema_version(&conn).unwrap(),
            Some(db::EXPECTED_SCHEMA_VERSION)
        );
        db::check_schema_version(&conn).unwrap();

        // Existing rows get the standard tier and are unprotected.
        let (tier, protected): (i64, i64) = conn
            .query_row(
                "select retention_tier, protected from recording",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(tier, 2);
        assert_eq!(protected, 0);

        // The thumbnail table exists now.
        conn.execute(
            "insert into thumbnail (recording_id, file_path) values (1, '/tmp/t.jpg')",
            params![],
        )
        .unwrap();
    }

    #[test]
    fn upgrade_noop_at_current_version() {
        testutil::init();
        let mut conn = new_conn();
        db::init(&mut conn).unwrap();
        upgrade(
            &Args {
                preset_journal: "delete",
                no_vacuum: true,
            },
            db::EXPECTED_SCHEMA_VERSION,
            &mut conn,
        )
        .unwrap();
        db::check_schema_version(&conn).unwrap();
    }
}
