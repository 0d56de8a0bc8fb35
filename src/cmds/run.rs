// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::app::{App, AppOptions};
use crate::config;
use crate::detect::DetectorRegistry;
use crate::pipeline::FfmpegPipeline;
use crate::storage::StatvfsDisk;
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs the recorder: starts every enabled stream, the storage controller,
/// and the schedule monitor, then waits for SIGINT/SIGTERM.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/lightnvr.toml".into()), debug_fallback)]
    config: PathBuf,

    /// Loads configuration but starts no streams; cleanup cycles still run.
    #[bpaf(long)]
    idle: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = config::load(&args.config)?;

    let conn = super::open_conn(&cfg.db_path, false)?;
    let db = Arc::new(Database::new(RealClocks {}, conn)?);
    {
        let mut l = db.lock();
        l.set_global(cfg.global.clone())?;
        for (name, stream_cfg) in &cfg.streams {
            l.upsert_stream(name, stream_cfg.clone())?;
        }
    }

    let pipeline = Arc::new(FfmpegPipeline::new(
        db.clone(),
        cfg.storage_path.clone(),
        cfg.storage_path_hls.clone(),
    ));

    // Detection back-ends register by model name here at configuration time.
    // None are built in; streams configured with a model log an error and run
    // without detection until one is provided.
    let detectors = Arc::new(DetectorRegistry::default());

    let app = App::start(
        db,
        pipeline,
        Arc::new(StatvfsDisk),
        detectors,
        AppOptions {
            storage_root: cfg.storage_path.clone(),
            thresholds: cfg.pressure.clone(),
            start_streams: !args.idle,
        },
    )?;
    info!(
        storage = %cfg.storage_path.display(),
        streams = cfg.streams.len(),
        "lightnvr running"
    );

    wait_for_signals(&app)?;

    app.stop();
    Ok(0)
}

/// Installs the signal handler and blocks until shutdown is requested.
fn wait_for_signals<C: base::clock::Clocks + Clone>(app: &App<C>) -> Result<(), Error> {
    let shutdown_rx = app.shutdown_rx();
    let requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let requested = requested.clone();
        ctrlc::set_handler(move || {
            if requested.swap(true, std::sync::atomic::Ordering::SeqCst) {
                warn!("second signal; still shutting down");
            } else {
                info!("signal received; shutting down");
            }
        })
        .map_err(|e| base::err!(Internal, msg("unable to install signal handler"), source(e)))?;
    }
    loop {
        if requested.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if shutdown_rx.wait_for(Duration::from_millis(250)).is_err() {
            return Ok(()); // shutdown requested programmatically
        }
    }
}
