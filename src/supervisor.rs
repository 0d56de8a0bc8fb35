// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The stream supervisor: one authoritative operational state per configured
//! stream, and the orchestration of the media pipeline's subsystems (HLS,
//! MP4 recording, detection) around it.
//!
//! Transitions are atomic under the per-stream state mutex; pipeline and
//! detector calls always happen outside it. Late callbacks are gated by an
//! `enabled` flag which is cleared first thing on stop.

use crate::detect::{self, DetectorRegistry};
use crate::pipeline::{recording_path, MediaPipeline};
use crate::schedule;
use base::clock::{self, Clocks};
use base::{bail, err, Error, FastHashMap, Mutex};
use db::json::StreamConfig;
use db::{Database, TriggerType};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often the schedule monitor re-reads configs and reconciles writers.
const SCHEDULE_MONITOR_PERIOD: Duration = Duration::from_secs(60);

/// A frame is a discontinuity when its pts jumps past the expected next pts
/// by more than this many nominal frame intervals, or runs backwards.
const DISCONTINUITY_TOLERANCE_INTERVALS: i64 = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    Inactive,
    Starting,
    Active,
    Stopping,
    Reconnecting,
    Error,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Inactive => "inactive",
            StreamStatus::Starting => "starting",
            StreamStatus::Active => "active",
            StreamStatus::Stopping => "stopping",
            StreamStatus::Reconnecting => "reconnecting",
            StreamStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the `record` and `detection_based_recording` flags combine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordingMode {
    None,
    Continuous,
    DetectionOnly,
    ContinuousWithAnnotation,
}

impl RecordingMode {
    pub fn of(cfg: &StreamConfig) -> Self {
        match (cfg.record, cfg.detection_based_recording) {
            (false, false) => RecordingMode::None,
            (true, false) => RecordingMode::Continuous,
            (false, true) => RecordingMode::DetectionOnly,
            (true, true) => RecordingMode::ContinuousWithAnnotation,
        }
    }
}

/// Rolling per-stream counters exposed through the query API.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_frame_time: Option<jiff::Timestamp>,
    pub timestamp_discontinuities: u64,
}

/// Timestamp-continuity tracking state.
#[derive(Debug, Default)]
struct Continuity {
    last_pts: Option<i64>,
    last_dts: Option<i64>,
    expected_next_pts: Option<i64>,
    discontinuities: u64,
}

#[derive(Debug)]
struct StreamStateInner {
    status: StreamStatus,
    config: StreamConfig,
    stats: StreamStats,
    continuity: Continuity,
    hls_started: bool,
    record_started: bool,
}

/// Runtime twin of one configured stream. Created on first reference,
/// destroyed on stream removal.
pub struct StreamState {
    name: String,

    /// Gate read first by every frame/detection callback; false while
    /// stopping so late callbacks short-circuit.
    enabled: AtomicBool,

    inner: Mutex<StreamStateInner>,
    last_detection: Mutex<Option<jiff::Timestamp>>,
}

impl StreamState {
    pub fn new(name: &str, config: StreamConfig) -> Self {
        Self {
            name: name.to_owned(),
            enabled: AtomicBool::new(false),
            inner: Mutex::new(StreamStateInner {
                status: StreamStatus::Inactive,
                config,
                stats: StreamStats::default(),
                continuity: Continuity::default(),
                hls_started: false,
                record_started: false,
            }),
            last_detection: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.lock().status
    }

    /// A copy of the config; taken under the mutex, used outside it.
    pub fn config(&self) -> StreamConfig {
        self.inner.lock().config.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().status == StreamStatus::Stopping
    }

    pub fn callbacks_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_callbacks_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn last_detection(&self) -> Option<jiff::Timestamp> {
        *self.last_detection.lock()
    }

    pub fn set_last_detection(&self, when: jiff::Timestamp) {
        *self.last_detection.lock() = Some(when);
    }

    pub fn stats(&self) -> StreamStats {
        let l = self.inner.lock();
        let mut stats = l.stats.clone();
        stats.timestamp_discontinuities = l.continuity.discontinuities;
        stats
    }

    pub fn observe_frame(&self, bytes: u64, when: jiff::Timestamp) {
        let mut l = self.inner.lock();
        l.stats.frames_received += 1;
        l.stats.bytes_received += bytes;
        l.stats.last_frame_time = Some(when);
    }

    pub fn note_error(&self) {
        self.inner.lock().stats.errors += 1;
    }

    /// Feeds one sample's timestamps into the continuity tracker.
    /// `nominal_interval` is the expected pts step between samples (same
    /// timebase as `pts`).
    pub fn note_timestamps(&self, pts: i64, dts: Option<i64>, nominal_interval: i64) {
        let mut l = self.inner.lock();
        let c = &mut l.continuity;
        if let Some(last) = c.last_pts {
            let tolerance = nominal_interval.saturating_mul(DISCONTINUITY_TOLERANCE_INTERVALS);
            let expected = c.expected_next_pts.unwrap_or(last + nominal_interval);
            if pts <= last || pts > expected + tolerance {
                c.discontinuities += 1;
            }
        }
        c.last_pts = Some(pts);
        c.last_dts = dts;
        c.expected_next_pts = Some(pts + nominal_interval);
    }
}

/// Which boolean stream feature a toggle targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Feature {
    Streaming,
    Recording,
    RecordOnSchedule,
    DetectionBasedRecording,
    Onvif,
}

impl Feature {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(Feature::Streaming),
            "recording" => Some(Feature::Recording),
            "record_on_schedule" => Some(Feature::RecordOnSchedule),
            "detection_based_recording" => Some(Feature::DetectionBasedRecording),
            "onvif" => Some(Feature::Onvif),
            _ => None,
        }
    }
}

/// Owns every [`StreamState`] and the detection workers.
pub struct Supervisor<C: Clocks + Clone> {
    clocks: C,
    db: Arc<Database<C>>,
    pipeline: Arc<dyn MediaPipeline>,
    detectors: Arc<DetectorRegistry>,
    storage_root: PathBuf,
    streams: Mutex<BTreeMap<String, Arc<StreamState>>>,
    workers: Mutex<FastHashMap<String, detect::WorkerHandle>>,
}

impl<C: Clocks + Clone> Supervisor<C> {
    /// Creates the supervisor with a state for every stream already in the
    /// repository, all Inactive.
    pub fn new(
        db: Arc<Database<C>>,
        pipeline: Arc<dyn MediaPipeline>,
        detectors: Arc<DetectorRegistry>,
        storage_root: PathBuf,
    ) -> Self {
        let clocks = db.clocks();
        let streams = db
            .lock()
            .streams()
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(StreamState::new(name, cfg.clone()))))
            .collect();
        Self {
            clocks,
            db,
            pipeline,
            detectors,
            storage_root,
            streams: Mutex::new(streams),
            workers: Mutex::new(FastHashMap::default()),
        }
    }

    fn state(&self, name: &str) -> Result<Arc<StreamState>, Error> {
        self.streams
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| err!(NotFound, msg("no such stream {name}")))
    }

    /// Persists and loads a stream configuration. An existing stream's
    /// runtime state is kept; its config snapshot is replaced.
    pub fn add_stream(&self, name: &str, config: StreamConfig) -> Result<(), Error> {
        self.db.lock().upsert_stream(name, config.clone())?;
        let mut l = self.streams.lock();
        match l.get(name) {
            Some(state) => state.inner.lock().config = config,
            None => {
                l.insert(name.to_owned(), Arc::new(StreamState::new(name, config)));
            }
        }
        Ok(())
    }

    /// Stops and removes a stream and its configuration.
    pub fn remove_stream(&self, name: &str) -> Result<(), Error> {
        self.stop_stream(name)?;
        self.streams.lock().remove(name);
        self.db.lock().delete_stream(name)?;
        Ok(())
    }

    pub fn stream_status(&self, name: &str) -> Option<StreamStatus> {
        self.streams.lock().get(name).map(|s| s.status())
    }

    pub fn stream_stats(&self, name: &str) -> Option<StreamStats> {
        self.streams.lock().get(name).map(|s| s.stats())
    }

    pub fn is_stopping(&self, name: &str) -> bool {
        self.streams
            .lock()
            .get(name)
            .map(|s| s.is_stopping())
            .unwrap_or(false)
    }

    /// Brings a stream up: HLS if streaming (or as a keepalive for
    /// detection-only recording), MP4 if recording is wanted and the
    /// schedule allows, then the detection worker.
    pub fn start_stream(&self, name: &str) -> Result<(), Error> {
        let state = self.state(name)?;
        {
            let mut inner = state.inner.lock();
            match inner.status {
                StreamStatus::Active => return Ok(()),
                StreamStatus::Starting | StreamStatus::Stopping => {
                    bail!(Aborted, msg("stream {name} is {}", inner.status));
                }
                _ => inner.status = StreamStatus::Starting,
            }
        }
        let cfg = state.config();
        if !cfg.enabled {
            state.inner.lock().status = StreamStatus::Inactive;
            bail!(FailedPrecondition, msg("stream {name} is disabled"));
        }

        // Detection-only recording still needs HLS as a keepalive so the
        // publisher remains connected.
        let want_hls = cfg.streaming_enabled || cfg.detection_based_recording;
        let mut hls_ok = None;
        if want_hls {
            hls_ok = Some(match self.pipeline.start_hls(name, &cfg) {
                Ok(()) => true,
                Err(e) => {
                    state.note_error();
                    error!(stream = %name, err = %e.chain(), "unable to start hls");
                    false
                }
            });
        }

        let now_local = self.clocks.realtime().to_zoned(jiff::tz::TimeZone::system());
        let want_record = cfg.record && schedule::is_recording_scheduled(&cfg, &now_local);
        let mut record_ok = None;
        if want_record {
            let trigger = if cfg.record_on_schedule {
                TriggerType::Scheduled
            } else {
                TriggerType::Continuous
            };
            let path = recording_path(&self.storage_root, name, trigger, &now_local);
            record_ok = Some(match self.pipeline.start_record(name, &cfg, trigger, &path) {
                Ok(()) => true,
                Err(e) => {
                    state.note_error();
                    error!(stream = %name, err = %e.chain(), "unable to start recording");
                    false
                }
            });
        }

        // At least one requested subsystem must have come up; a stream with
        // nothing requested is trivially up.
        let ok = match (hls_ok, record_ok) {
            (None, None) => true,
            _ => hls_ok == Some(true) || record_ok == Some(true),
        };
        {
            let mut inner = state.inner.lock();
            inner.hls_started = hls_ok == Some(true);
            inner.record_started = record_ok == Some(true);
            inner.status = if ok { StreamStatus::Active } else { StreamStatus::Error };
        }
        if !ok {
            bail!(Unavailable, msg("no subsystem of stream {name} started"));
        }
        state.set_callbacks_enabled(true);
        info!(stream = %name, mode = ?RecordingMode::of(&cfg), "stream started");

        if cfg.detection_based_recording {
            if cfg.detection_model.is_empty() {
                warn!(stream = %name, "detection-based recording set but no detection model");
            } else if let Err(e) = self.start_detection_worker(&state, cfg.record) {
                // The stream itself stays up; detection is best-effort.
                error!(stream = %name, err = %e.chain(), "unable to start detection worker");
            }
        }
        Ok(())
    }

    /// Takes a stream down, stopping whatever was started on its behalf.
    pub fn stop_stream(&self, name: &str) -> Result<(), Error> {
        let state = self.state(name)?;
        {
            let mut inner = state.inner.lock();
            if inner.status == StreamStatus::Inactive {
                return Ok(());
            }
            inner.status = StreamStatus::Stopping;
        }
        state.set_callbacks_enabled(false);
        self.stop_detection_worker(name);
        self.pipeline.stop_frame_tap(name);

        let (hls_started, record_started) = {
            let inner = state.inner.lock();
            (inner.hls_started, inner.record_started)
        };
        if hls_started {
            if let Err(e) = self.pipeline.stop_hls(name) {
                error!(stream = %name, err = %e.chain(), "unable to stop hls");
            }
        }
        if record_started || self.pipeline.is_recording(name) {
            if let Err(e) = self.pipeline.stop_record(name) {
                error!(stream = %name, err = %e.chain(), "unable to stop recording");
            }
        }
        {
            let mut inner = state.inner.lock();
            inner.status = StreamStatus::Inactive;
            inner.hls_started = false;
            inner.record_started = false;
        }
        info!(stream = %name, "stream stopped");
        Ok(())
    }

    /// Handles a sustained read error from the pipeline: bounce HLS and
    /// either return to Active or land in Error.
    pub fn reconnect(&self, name: &str) -> Result<(), Error> {
        let state = self.state(name)?;
        {
            let mut inner = state.inner.lock();
            if inner.status != StreamStatus::Active {
                bail!(
                    FailedPrecondition,
                    msg("stream {name} is {}; not reconnecting", inner.status)
                );
            }
            inner.status = StreamStatus::Reconnecting;
        }
        state.note_error();
        let cfg = state.config();
        let _ = self.pipeline.stop_hls(name);
        match self.pipeline.start_hls(name, &cfg) {
            Ok(()) => {
                state.inner.lock().status = StreamStatus::Active;
                info!(stream = %name, "reconnected");
                Ok(())
            }
            Err(e) => {
                state.inner.lock().status = StreamStatus::Error;
                error!(stream = %name, err = %e.chain(), "reconnect failed");
                Err(e)
            }
        }
    }

    /// Flips one boolean feature on the in-memory config and manages the
    /// detection worker on `detection_based_recording` edges. Returns the
    /// updated config; persisting it to the repository is the caller's job.
    pub fn set_feature(
        &self,
        name: &str,
        feature: Feature,
        enabled: bool,
    ) -> Result<StreamConfig, Error> {
        let state = self.state(name)?;
        let (was_dbr, cfg) = {
            let mut inner = state.inner.lock();
            let was_dbr = inner.config.detection_based_recording;
            match feature {
                Feature::Streaming => inner.config.streaming_enabled = enabled,
                Feature::Recording => inner.config.record = enabled,
                Feature::RecordOnSchedule => inner.config.record_on_schedule = enabled,
                Feature::DetectionBasedRecording => {
                    inner.config.detection_based_recording = enabled
                }
                Feature::Onvif => inner.config.is_onvif = enabled,
            }
            (was_dbr, inner.config.clone())
        };
        if feature == Feature::DetectionBasedRecording {
            if !was_dbr && enabled {
                if cfg.detection_model.is_empty() {
                    warn!(stream = %name, "detection-based recording set but no detection model");
                } else if let Err(e) = self.start_detection_worker(&state, cfg.record) {
                    error!(stream = %name, err = %e.chain(), "unable to start detection worker");
                }
            } else if was_dbr && !enabled {
                self.stop_detection_worker(name);
                self.pipeline.stop_frame_tap(name);
            }
        }
        Ok(cfg)
    }

    /// Starts the detection worker for a stream unless one is already
    /// running; there is never more than one per stream.
    fn start_detection_worker(
        &self,
        state: &Arc<StreamState>,
        annotation_only: bool,
    ) -> Result<(), Error> {
        let name = state.name().to_owned();
        let mut workers = self.workers.lock();
        if workers.contains_key(&name) {
            return Ok(());
        }
        let cfg = state.config();
        let detector = self.detectors.get(&cfg.detection_model)?;
        let frames = self.pipeline.start_frame_tap(&name, &cfg)?;
        let worker = detect::Worker::new(
            self.clocks.clone(),
            self.db.clone(),
            self.pipeline.clone(),
            detector,
            state.clone(),
            self.storage_root.clone(),
            annotation_only,
        );
        let handle = detect::spawn(worker, frames)?;
        workers.insert(name, handle);
        Ok(())
    }

    fn stop_detection_worker(&self, name: &str) {
        if let Some(handle) = self.workers.lock().remove(name) {
            handle.stop();
        }
    }

    #[cfg(test)]
    fn has_detection_worker(&self, name: &str) -> bool {
        self.workers.lock().contains_key(name)
    }

    /// Stops every stream; used at shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.streams.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_stream(&name) {
                error!(stream = %name, err = %e.chain(), "unable to stop stream at shutdown");
            }
        }
    }
}

/// The schedule monitor: wakes every minute, re-reads per-stream configs
/// from the repository (picking up UI edits), and reconciles MP4 writer
/// liveness with the schedule gate for every schedule-gated stream.
///
/// It deliberately does not gate on operational state; the pipeline treats a
/// start/stop for a stream that isn't actually up as a no-op.
pub struct ScheduleMonitor {
    running: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ScheduleMonitor {
    pub fn start<C: Clocks + Clone>(
        db: Arc<Database<C>>,
        pipeline: Arc<dyn MediaPipeline>,
        storage_root: PathBuf,
        shutdown_rx: base::shutdown::Receiver,
    ) -> Result<Self, Error> {
        let running = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(AtomicBool::new(false));
        let join = thread::Builder::new()
            .name("schedule".to_owned())
            .spawn({
                let running = running.clone();
                let exited = exited.clone();
                let storage_root = storage_root.clone();
                move || {
                    info!("starting");
                    while running.load(Ordering::SeqCst) {
                        if shutdown_rx.wait_for(SCHEDULE_MONITOR_PERIOD).is_err() {
                            break;
                        }
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        scan(&db, &*pipeline, &storage_root);
                    }
                    exited.store(true, Ordering::SeqCst);
                    info!("ending");
                }
            })
            .map_err(|e| err!(Internal, msg("unable to spawn schedule monitor"), source(e)))?;
        Ok(Self {
            running,
            exited,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops the monitor. Expects the shutdown sender to have been dropped
    /// already so the thread isn't still in its timed wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.lock().take() {
            clock::join_or_detach(join, &self.exited, "schedule monitor");
        }
    }
}

/// One reconciliation pass of the schedule monitor.
pub(crate) fn scan<C: Clocks + Clone>(
    db: &Database<C>,
    pipeline: &dyn MediaPipeline,
    storage_root: &Path,
) {
    let now_local = db.clocks().realtime().to_zoned(jiff::tz::TimeZone::system());
    let streams = db.lock().streams().clone();
    for (name, cfg) in &streams {
        if !(cfg.record && cfg.enabled && cfg.record_on_schedule) {
            continue;
        }
        let should_record = schedule::is_recording_scheduled(cfg, &now_local);
        let writer_alive = pipeline.writer_alive(name);
        if should_record && !writer_alive {
            let path = recording_path(storage_root, name, TriggerType::Scheduled, &now_local);
            info!(stream = %name, "schedule window open; starting recording");
            if let Err(e) = pipeline.start_record(name, cfg, TriggerType::Scheduled, &path) {
                error!(stream = %name, err = %e.chain(), "unable to start scheduled recording");
            }
        } else if !should_record && writer_alive {
            info!(stream = %name, "schedule window closed; stopping recording");
            if let Err(e) = pipeline.stop_record(name) {
                error!(stream = %name, err = %e.chain(), "unable to stop scheduled recording");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detector, Observation};
    use crate::pipeline::testing::{Call, FakePipeline};
    use crate::pipeline::Frame;
    use base::clock::SimulatedClocks;
    use db::testutil::{self, TestDb, TEST_STREAM};

    struct NullDetector;

    impl Detector for NullDetector {
        fn infer(&self, _frame: &Frame) -> Result<Vec<Observation>, Error> {
            Ok(vec![])
        }
    }

    struct Setup {
        clocks: SimulatedClocks,
        tdb: TestDb<SimulatedClocks>,
        pipeline: Arc<FakePipeline>,
        supervisor: Supervisor<SimulatedClocks>,
    }

    fn setup_at(boot: &str, configure: impl FnOnce(&mut StreamConfig)) -> Setup {
        testutil::init();
        let clocks = SimulatedClocks::new(boot.parse().unwrap());
        let tdb = TestDb::new(clocks.clone());
        {
            let mut l = tdb.db.lock();
            let mut cfg = l.get_stream(TEST_STREAM).unwrap().clone();
            cfg.source_url = Some("rtsp://test-camera/main".parse().unwrap());
            configure(&mut cfg);
            l.upsert_stream(TEST_STREAM, cfg).unwrap();
        }
        let pipeline = FakePipeline::new();
        let detectors = Arc::new(DetectorRegistry::default());
        detectors.register("testmodel", Arc::new(NullDetector));
        let supervisor = Supervisor::new(
            tdb.db.clone(),
            pipeline.clone(),
            detectors,
            tdb.storage_root(),
        );
        Setup {
            clocks,
            tdb,
            pipeline,
            supervisor,
        }
    }

    fn setup(configure: impl FnOnce(&mut StreamConfig)) -> Setup {
        setup_at("2026-03-03T12:00:00Z", configure)
    }

    #[test]
    fn recording_mode_table() {
        let mut cfg = StreamConfig::default();
        cfg.record = false;
        cfg.detection_based_recording = false;
        assert_eq!(RecordingMode::of(&cfg), RecordingMode::None);
        cfg.record = true;
        assert_eq!(RecordingMode::of(&cfg), RecordingMode::Continuous);
        cfg.detection_based_recording = true;
        assert_eq!(RecordingMode::of(&cfg), RecordingMode::ContinuousWithAnnotation);
        cfg.record = false;
        assert_eq!(RecordingMode::of(&cfg), RecordingMode::DetectionOnly);
    }

    #[test]
    fn start_and_stop_continuous() {
        let s = setup(|c| c.record = true);
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
        let calls = s.pipeline.take_calls();
        assert!(matches!(&calls[0], Call::StartHls(n) if n == TEST_STREAM));
        assert!(
            matches!(&calls[1], Call::StartRecord(n, TriggerType::Continuous, _) if n == TEST_STREAM)
        );

        // Starting an active stream is a no-op.
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert!(s.pipeline.take_calls().is_empty());

        s.supervisor.stop_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Inactive)
        );
        let calls = s.pipeline.take_calls();
        assert!(calls.contains(&Call::StopHls(TEST_STREAM.to_owned())));
        assert!(calls.contains(&Call::StopRecord(TEST_STREAM.to_owned())));

        // Stopping again is also a no-op.
        s.supervisor.stop_stream(TEST_STREAM).unwrap();
        assert!(s.pipeline.take_calls().is_empty());
    }

    #[test]
    fn detection_only_keeps_hls_alive_and_spawns_worker() {
        let s = setup(|c| {
            c.streaming_enabled = false;
            c.detection_based_recording = true;
            c.detection_model = "testmodel".to_owned();
        });
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
        let calls = s.pipeline.calls();
        assert!(calls.contains(&Call::StartHls(TEST_STREAM.to_owned())));
        assert!(calls.contains(&Call::StartTap(TEST_STREAM.to_owned())));
        assert!(calls.iter().all(|c| !matches!(c, Call::StartRecord(..))));
        assert!(s.supervisor.has_detection_worker(TEST_STREAM));

        s.supervisor.stop_stream(TEST_STREAM).unwrap();
        assert!(!s.supervisor.has_detection_worker(TEST_STREAM));
        assert!(!s.supervisor.is_stopping(TEST_STREAM));
    }

    #[test]
    fn start_failure_lands_in_error() {
        let s = setup(|c| c.record = true);
        s.pipeline.fail_hls.store(true, Ordering::SeqCst);
        s.pipeline.fail_record.store(true, Ordering::SeqCst);
        s.supervisor.start_stream(TEST_STREAM).unwrap_err();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Error)
        );
        assert!(s.supervisor.stream_stats(TEST_STREAM).unwrap().errors >= 2);
    }

    #[test]
    fn partial_start_is_active() {
        let s = setup(|c| c.record = true);
        s.pipeline.fail_record.store(true, Ordering::SeqCst);
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
    }

    #[test]
    fn disabled_stream_does_not_start() {
        let s = setup(|c| c.enabled = false);
        let e = s.supervisor.start_stream(TEST_STREAM).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Inactive)
        );
        assert!(s.pipeline.calls().is_empty());
    }

    #[test]
    fn all_zero_schedule_never_starts_recording() {
        let s = setup(|c| {
            c.record = true;
            c.record_on_schedule = true;
            c.recording_schedule = "0".repeat(crate::schedule::SLOTS);
        });
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
        assert!(s
            .pipeline
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::StartRecord(..))));
    }

    /// A schedule allowing only Monday 00:00-07:59 local time.
    fn monday_mornings() -> String {
        let mut slots = vec!['0'; crate::schedule::SLOTS];
        for hour in 0..8 {
            slots[24 + hour] = '1';
        }
        slots.into_iter().collect()
    }

    #[test]
    fn monitor_scan_stops_writer_at_window_edge() {
        // Boot just before the Monday 08:00 edge, local time.
        let s = setup_at("2026-03-02T07:59:00-08:00", |c| {
            c.record = true;
            c.record_on_schedule = true;
            c.recording_schedule = monday_mornings();
        });

        // 07:59: in the window with no writer; the scan starts one.
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.writer_alive(TEST_STREAM));
        let calls = s.pipeline.take_calls();
        assert!(
            matches!(&calls[0], Call::StartRecord(n, TriggerType::Scheduled, _) if n == TEST_STREAM)
        );

        // 07:59:59: still in the window; nothing to do.
        s.clocks.sleep(Duration::from_secs(59));
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.take_calls().is_empty());
        assert!(s.pipeline.writer_alive(TEST_STREAM));

        // 08:00:00: out of the window; the scan issues a stop.
        s.clocks.sleep(Duration::from_secs(1));
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert_eq!(
            s.pipeline.take_calls(),
            vec![Call::StopRecord(TEST_STREAM.to_owned())]
        );
        assert!(!s.pipeline.writer_alive(TEST_STREAM));

        // A later scan with the writer already dead does nothing.
        s.clocks.sleep(Duration::from_secs(30));
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.take_calls().is_empty());
    }

    #[test]
    fn monitor_scan_restarts_dead_writer_in_window() {
        let s = setup_at("2026-03-02T03:00:00-08:00", |c| {
            c.record = true;
            c.record_on_schedule = true;
            c.recording_schedule = monday_mornings();
        });
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.writer_alive(TEST_STREAM));
        s.pipeline.kill_writer(TEST_STREAM);
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.writer_alive(TEST_STREAM));
    }

    #[test]
    fn monitor_ignores_unscheduled_streams() {
        let s = setup(|c| {
            c.record = true;
            c.record_on_schedule = false;
        });
        scan(&s.tdb.db, &*s.pipeline, &s.tdb.storage_root());
        assert!(s.pipeline.calls().is_empty());
    }

    #[test]
    fn set_feature_toggles_worker_on_dbr_edges() {
        let s = setup(|c| c.detection_model = "testmodel".to_owned());
        assert!(!s.supervisor.has_detection_worker(TEST_STREAM));

        let cfg = s
            .supervisor
            .set_feature(TEST_STREAM, Feature::DetectionBasedRecording, true)
            .unwrap();
        assert!(cfg.detection_based_recording);
        assert!(s.supervisor.has_detection_worker(TEST_STREAM));

        // Same value again: no second worker, same config.
        let cfg2 = s
            .supervisor
            .set_feature(TEST_STREAM, Feature::DetectionBasedRecording, true)
            .unwrap();
        assert_eq!(cfg, cfg2);
        assert!(s.supervisor.has_detection_worker(TEST_STREAM));

        let cfg3 = s
            .supervisor
            .set_feature(TEST_STREAM, Feature::DetectionBasedRecording, false)
            .unwrap();
        assert!(!cfg3.detection_based_recording);
        assert!(!s.supervisor.has_detection_worker(TEST_STREAM));
    }

    #[test]
    fn set_feature_is_idempotent_on_config() {
        let s = setup(|_| {});
        let a = s
            .supervisor
            .set_feature(TEST_STREAM, Feature::Recording, true)
            .unwrap();
        let b = s
            .supervisor
            .set_feature(TEST_STREAM, Feature::Recording, true)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(Feature::parse("recording"), Some(Feature::Recording));
        assert_eq!(Feature::parse("nonsense"), None);
    }

    #[test]
    fn reconnect_returns_to_active_or_error() {
        let s = setup(|_| {});
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        s.supervisor.reconnect(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Active)
        );
        assert_eq!(s.supervisor.stream_stats(TEST_STREAM).unwrap().errors, 1);

        s.pipeline.fail_hls.store(true, Ordering::SeqCst);
        s.supervisor.reconnect(TEST_STREAM).unwrap_err();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Error)
        );

        // Error states need an explicit stop (manual reset) before starting.
        s.supervisor.stop_stream(TEST_STREAM).unwrap();
        assert_eq!(
            s.supervisor.stream_status(TEST_STREAM),
            Some(StreamStatus::Inactive)
        );
    }

    #[test]
    fn unknown_stream_queries() {
        let s = setup(|_| {});
        assert_eq!(s.supervisor.stream_status("nope"), None);
        assert_eq!(s.supervisor.stream_stats("nope"), None);
        assert_eq!(
            s.supervisor.start_stream("nope").unwrap_err().kind(),
            base::ErrorKind::NotFound
        );
    }

    #[test]
    fn continuity_counts_gaps_and_reversals() {
        let state = StreamState::new("x", StreamConfig::default());
        let interval = 3000; // 90 kHz units at 30 fps
        state.note_timestamps(0, Some(0), interval);
        state.note_timestamps(3000, Some(3000), interval);
        state.note_timestamps(6000, Some(6000), interval);
        assert_eq!(state.stats().timestamp_discontinuities, 0);

        // A jump past 10 intervals of tolerance.
        state.note_timestamps(6000 + 3000 + 31_000, None, interval);
        assert_eq!(state.stats().timestamp_discontinuities, 1);

        // Running backwards.
        state.note_timestamps(100, None, interval);
        assert_eq!(state.stats().timestamp_discontinuities, 2);

        // Normal progression resumes cleanly.
        state.note_timestamps(3100, None, interval);
        assert_eq!(state.stats().timestamp_discontinuities, 2);
    }

    #[test]
    fn observe_frame_updates_stats() {
        let s = setup(|_| {});
        let state = s.supervisor.state(TEST_STREAM).unwrap();
        let t = s.clocks.realtime();
        state.observe_frame(100, t);
        state.observe_frame(50, t);
        let stats = s.supervisor.stream_stats(TEST_STREAM).unwrap();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.bytes_received, 150);
        assert_eq!(stats.last_frame_time, Some(t));
    }

    #[test]
    fn remove_stream_tears_down() {
        let s = setup(|c| {
            c.detection_based_recording = true;
            c.detection_model = "testmodel".to_owned();
        });
        s.supervisor.start_stream(TEST_STREAM).unwrap();
        assert!(s.supervisor.has_detection_worker(TEST_STREAM));
        s.supervisor.remove_stream(TEST_STREAM).unwrap();
        assert_eq!(s.supervisor.stream_status(TEST_STREAM), None);
        assert!(!s.supervisor.has_detection_worker(TEST_STREAM));
        assert!(s.tdb.db.lock().get_stream(TEST_STREAM).is_none());
    }
}
