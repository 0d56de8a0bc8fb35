// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The TOML configuration file.
//!
//! A `[global]` table plus zero or more `[[stream]]` tables. Stream tables
//! share their field set with the persisted [`StreamConfig`]; on startup the
//! file's streams are upserted into the repository, which remains the
//! authority afterwards (UI edits land there, not here).
//!
//! ```toml
//! [global]
//! storage_path = "/var/lib/lightnvr"
//! retention_days = 30
//! max_size = "500G"
//!
//! [[stream]]
//! name = "front_door"
//! source_url = "rtsp://user:pw@192.168.1.10/main"
//! record = true
//! ```

use crate::storage::PressureThresholds;
use base::strutil;
use base::{bail, err, Error};
use db::json::{GlobalConfig, StreamConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Database filename under `storage_path` when `db_path` is not set.
const DEFAULT_DB_FILENAME: &str = "lightnvr.db";

#[derive(Clone, Debug, Deserialize)]
struct ConfigFile {
    global: GlobalSection,
    #[serde(default, rename = "stream")]
    streams: Vec<StreamSection>,
}

#[derive(Clone, Debug, Deserialize)]
struct GlobalSection {
    storage_path: PathBuf,
    #[serde(default)]
    storage_path_hls: Option<PathBuf>,
    #[serde(default)]
    db_path: Option<PathBuf>,

    /// Human-readable total storage budget, e.g. `500G`.
    #[serde(default)]
    max_size: Option<String>,

    #[serde(default = "default_retention_days")]
    retention_days: u32,
    #[serde(default)]
    mqtt_topic_prefix: String,
    #[serde(default)]
    models_path: Option<PathBuf>,
    #[serde(default)]
    pressure: PressureThresholds,
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Clone, Debug, Deserialize)]
struct StreamSection {
    name: String,
    #[serde(flatten)]
    config: StreamConfig,
}

/// Parsed configuration, ready for `cmds::run`.
#[derive(Clone, Debug)]
pub struct Config {
    pub storage_path: PathBuf,
    pub storage_path_hls: Option<PathBuf>,
    pub db_path: PathBuf,
    pub pressure: PressureThresholds,
    pub global: GlobalConfig,
    pub streams: Vec<(String, StreamConfig)>,
}

pub fn load(path: &Path) -> Result<Config, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read config {}", path.display()), source(e)))?;
    parse(&text)
}

fn parse(text: &str) -> Result<Config, Error> {
    let f: ConfigFile = toml::from_str(text)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse config"), source(e)))?;
    let g = f.global;
    let max_size_bytes = match &g.max_size {
        None => 0,
        Some(s) => strutil::decode_size(s)
            .map_err(|()| err!(InvalidArgument, msg("bad max_size {s:?}")))?,
    };
    let mut streams = Vec::with_capacity(f.streams.len());
    for s in f.streams {
        db::db::validate_stream_name(&s.name)?;
        if streams.iter().any(|(n, _)| *n == s.name) {
            bail!(InvalidArgument, msg("duplicate stream {:?}", s.name));
        }
        streams.push((s.name, s.config));
    }
    Ok(Config {
        db_path: g
            .db_path
            .unwrap_or_else(|| g.storage_path.join(DEFAULT_DB_FILENAME)),
        storage_path_hls: g.storage_path_hls,
        pressure: g.pressure,
        global: GlobalConfig {
            retention_days: g.retention_days,
            max_size_bytes,
            mqtt_topic_prefix: g.mqtt_topic_prefix,
            models_path: g
                .models_path
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            unknown: Default::default(),
        },
        storage_path: g.storage_path,
        streams,
    })
}
