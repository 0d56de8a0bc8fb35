// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::config;
use base::{bail, err, Error};
use bpaf::Bpaf;
use rusqlite::params;
use std::path::PathBuf;
use tracing::info;

/// Initializes the storage directory skeleton and the metadata database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/lightnvr.toml".into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = config::load(&args.config)?;

    std::fs::create_dir_all(&cfg.storage_path).map_err(|e| {
        err!(Unavailable, msg("unable to create {}", cfg.storage_path.display()), source(e))
    })?;
    for d in ["mp4", "recordings", "hls", "thumbnails"] {
        std::fs::create_dir_all(cfg.storage_path.join(d))?;
    }
    if let Some(hls) = &cfg.storage_path_hls {
        std::fs::create_dir_all(hls)?;
    }
    if let Some(parent) = cfg.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if cfg.db_path.exists() {
        bail!(
            AlreadyExists,
            msg("database {} already exists", cfg.db_path.display())
        );
    }
    let mut conn = rusqlite::Connection::open(&cfg.db_path)
        .map_err(|e| err!(Unavailable, msg("unable to create {}", cfg.db_path.display()), source(e)))?;

    // 16 KiB pages and write-ahead logging; page_size takes effect when the
    // database file is created. The journal_mode pragma returns a row, so it
    // can't go through execute.
    conn.execute_batch("pragma page_size = 16384;")?;
    conn.query_row("pragma journal_mode = wal", params![], |_row| Ok(()))?;
    db::db::init(&mut conn)?;
    conn.execute(
        "update meta set config = ?",
        params![&cfg.global],
    )?;
    info!(db = %cfg.db_path.display(), "database initialized");
    Ok(0)
}
