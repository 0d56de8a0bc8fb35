// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommands.

use base::{err, Error};
use std::path::Path;

pub mod check;
pub mod init;
pub mod run;

/// Opens the SQLite database at `path`.
fn open_conn(path: &Path, read_only: bool) -> Result<rusqlite::Connection, Error> {
    let flags = if read_only {
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    rusqlite::Connection::open_with_flags(path, flags)
        .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))
}
