// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades a version 0 schema to a version 1 schema: adds the tiered
//! retention columns on `recording` and the `thumbnail` table.

use base::Error;

pub fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(
        r#"
        alter table recording add column retention_tier integer not null default 2;
        alter table recording add column protected integer not null default 0;

        create table thumbnail (
          id integer primary key,
          recording_id integer not null,
          file_path text not null
        );

        create index thumbnail_recording on thumbnail (recording_id);
        "#,
    )?;
    Ok(())
}
