// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The application context: one authoritative instance of each core service,
//! wired together with explicit, ordered startup and shutdown.
//!
//! Startup order: repository (passed in) → supervisor → storage controller →
//! schedule monitor. Shutdown reverses it, after signalling every worker
//! through the shared shutdown channel.

use crate::bus::Bus;
use crate::detect::DetectorRegistry;
use crate::pipeline::MediaPipeline;
use crate::storage::{
    DiskUsage, Options as StorageOptions, PressureLevel, PressureThresholds, StorageController,
    StorageHealth,
};
use crate::supervisor::{ScheduleMonitor, StreamStats, StreamStatus, Supervisor};
use base::clock::Clocks;
use base::shutdown;
use base::{Error, Mutex};
use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

pub struct AppOptions {
    pub storage_root: PathBuf,
    pub thresholds: PressureThresholds,

    /// Whether to bring every enabled stream up immediately.
    pub start_streams: bool,
}

pub struct App<C: Clocks + Clone> {
    pub db: Arc<Database<C>>,
    pub bus: Bus,
    pub detectors: Arc<DetectorRegistry>,
    pub supervisor: Arc<Supervisor<C>>,
    storage: StorageController<C>,
    monitor: ScheduleMonitor,
    shutdown_tx: Mutex<Option<shutdown::Sender>>,
    shutdown_rx: shutdown::Receiver,
}

impl<C: Clocks + Clone> App<C> {
    pub fn start(
        db: Arc<Database<C>>,
        pipeline: Arc<dyn MediaPipeline>,
        disk: Arc<dyn DiskUsage>,
        detectors: Arc<DetectorRegistry>,
        opts: AppOptions,
    ) -> Result<Self, Error> {
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let bus = Bus::new();

        let supervisor = Arc::new(Supervisor::new(
            db.clone(),
            pipeline.clone(),
            detectors.clone(),
            opts.storage_root.clone(),
        ));

        let mut storage_opts = StorageOptions::new(opts.storage_root.clone());
        storage_opts.thresholds = opts.thresholds;
        let storage = StorageController::start(
            db.clone(),
            bus.clone(),
            disk,
            storage_opts,
            shutdown_rx.clone(),
        )?;

        let monitor = ScheduleMonitor::start(
            db.clone(),
            pipeline,
            opts.storage_root.clone(),
            shutdown_rx.clone(),
        )?;

        let app = Self {
            db,
            bus,
            detectors,
            supervisor,
            storage,
            monitor,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        };
        if opts.start_streams {
            app.start_enabled_streams();
        }
        Ok(app)
    }

    fn start_enabled_streams(&self) {
        let streams = self.db.lock().streams().clone();
        for (name, cfg) in &streams {
            if !cfg.enabled {
                info!(stream = %name, "disabled; not starting");
                continue;
            }
            if let Err(e) = self.supervisor.start_stream(name) {
                error!(stream = %name, err = %e.chain(), "unable to start stream");
            }
        }
    }

    /// A receiver on the app-wide shutdown channel, for embedding callers.
    pub fn shutdown_rx(&self) -> shutdown::Receiver {
        self.shutdown_rx.clone()
    }

    /// Requests shutdown without waiting; `stop` completes it.
    pub fn request_shutdown(&self) {
        drop(self.shutdown_tx.lock().take());
    }

    /// Ordered shutdown: signal everything, then stop the schedule monitor,
    /// storage controller, and streams, reversing startup order.
    pub fn stop(self) {
        info!("shutting down");
        self.request_shutdown();
        self.monitor.stop();
        self.storage.stop();
        self.supervisor.stop_all();
        info!("shutdown complete");
    }

    // The in-process query API.

    pub fn health_snapshot(&self) -> StorageHealth {
        self.storage.health_snapshot()
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.storage.pressure_level()
    }

    pub fn trigger_cleanup(&self, aggressive: bool) {
        self.storage.trigger_cleanup(aggressive)
    }

    /// `None` means the stream is unknown.
    pub fn stream_status(&self, name: &str) -> Option<StreamStatus> {
        self.supervisor.stream_status(name)
    }

    pub fn stream_stats(&self, name: &str) -> Option<StreamStats> {
        self.supervisor.stream_stats(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::FakePipeline;
    use base::clock::SimulatedClocks;
    use db::json::StreamConfig;
    use db::testutil::{self, TestDb, TEST_STREAM};

    #[test]
    fn lifecycle_smoke() {
        testutil::init();
        let clocks = SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap());
        let tdb = TestDb::new(clocks.clone());
        {
            let mut l = tdb.db.lock();
            let mut cfg = StreamConfig::default();
            cfg.source_url = Some("rtsp://test-camera/main".parse().unwrap());
            cfg.record = true;
            l.upsert_stream(TEST_STREAM, cfg).unwrap();
        }
        let pipeline = FakePipeline::new();
        let app = App::start(
            tdb.db.clone(),
            pipeline.clone(),
            Arc::new(crate::storage::StatvfsDisk),
            Arc::new(DetectorRegistry::default()),
            AppOptions {
                storage_root: tdb.storage_root(),
                thresholds: PressureThresholds::default(),
                start_streams: true,
            },
        )
        .unwrap();

        assert_eq!(
            app.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
        assert_eq!(app.stream_status("nope"), None);
        assert!(pipeline.is_recording(TEST_STREAM));

        app.trigger_cleanup(false);
        app.stop();
        assert!(!pipeline.is_recording(TEST_STREAM));
    }
}
