// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::config;
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Checks database/filesystem consistency and reports what a cleanup cycle
/// would see. Read-only; never repairs anything.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/lightnvr.toml".into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = config::load(&args.config)?;
    let conn = super::open_conn(&cfg.db_path, true)?;
    let db = Arc::new(Database::new(RealClocks {}, conn)?);
    let l = db.lock();

    let mut problems = 0;
    if !cfg.storage_path.is_dir() {
        error!(path = %cfg.storage_path.display(), "storage root is missing");
        problems += 1;
    }
    if !cfg.storage_path.join("mp4").is_dir() {
        error!(path = %cfg.storage_path.join("mp4").display(), "mp4/ directory is missing; the orphan pass will refuse to run");
        problems += 1;
    }

    for (name, stream_cfg) in l.streams() {
        let policy = db::RetentionPolicy::effective(stream_cfg, l.global().retention_days);
        let bytes = l.stream_storage_bytes(name)?;
        info!(
            stream = %name,
            bytes,
            retention_days = policy.retention_days,
            detection_retention_days = policy.detection_retention_days,
            quota_mb = policy.max_storage_mb,
            "stream"
        );
        if policy.max_storage_mb > 0 && bytes > policy.max_storage_mb * 1024 * 1024 {
            warn!(stream = %name, "over quota; next standard cycle will evict");
        }
    }

    let (orphans, checked) = l.orphaned_recordings(100)?;
    if orphans.is_empty() {
        info!(checked, "no orphaned recording rows");
    } else {
        warn!(orphans = orphans.len(), checked, "orphaned recording rows found");
        for o in &orphans {
            warn!(stream = %o.stream_name, path = %o.file_path.display(), "missing file");
        }
        problems += 1;
    }

    Ok(if problems == 0 { 0 } else { 1 })
}
