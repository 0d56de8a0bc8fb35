// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Object detection workers and the recording policy they drive.
//!
//! One worker runs per stream with `detection_based_recording` set. It
//! samples the stream's frame tap (one frame in `detection_interval`), runs
//! the configured [`Detector`], filters the results through the stream's
//! zones and object filter, and persists the survivors. The policy engine
//! then decides from the persisted history whether a detection-triggered
//! recording should be open right now.
//!
//! In annotation-only mode (continuous recording is already running) the
//! worker persists detections but never opens or closes recordings.

use crate::pipeline::{recording_path, Frame, MediaPipeline};
use crate::supervisor::StreamState;
use crate::zone;
use base::clock::{self, Clocks};
use base::{err, Error, FastHashMap, Mutex};
use db::json::ObjectFilterKind;
use db::{Database, Detection, TriggerType};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// How far back the policy engine looks for detections that keep a recording
/// open.
pub const MAX_DETECTION_AGE: Duration = Duration::from_secs(30);

/// Hard floor on the triggering confidence, enforced regardless of
/// configuration to suppress noise.
pub const TRIGGER_CONFIDENCE_FLOOR: f32 = 0.5;

/// How often an idle worker re-evaluates the recording decision so a
/// recording closes once the detection window expires.
const IDLE_EVALUATION_PERIOD: Duration = Duration::from_secs(1);

/// One labelled box from a detector, in normalized `[0,1]²` coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub label: String,
    pub confidence: f32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// An inference back-end. Implementations convert frames to whatever their
/// model needs; the core places no format constraint beyond [`Frame`]'s RGB24.
pub trait Detector: Send + Sync + 'static {
    fn infer(&self, frame: &Frame) -> Result<Vec<Observation>, Error>;
}

impl std::fmt::Debug for dyn Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector").finish_non_exhaustive()
    }
}

/// Detector back-ends by model name, chosen at configuration time.
/// Engines (local model runtimes, remote HTTP detectors) register here
/// during startup; streams name them via `detection_model`.
#[derive(Default)]
pub struct DetectorRegistry {
    by_model: Mutex<FastHashMap<String, Arc<dyn Detector>>>,
}

impl DetectorRegistry {
    pub fn register(&self, model: &str, detector: Arc<dyn Detector>) {
        self.by_model.lock().insert(model.to_owned(), detector);
    }

    pub fn get(&self, model: &str) -> Result<Arc<dyn Detector>, Error> {
        self.by_model
            .lock()
            .get(model)
            .cloned()
            .ok_or_else(|| err!(Unimplemented, msg("no detector registered for model {model:?}")))
    }
}

/// The configured threshold with the hard floor applied.
pub fn effective_threshold(configured: f32) -> f32 {
    configured.max(TRIGGER_CONFIDENCE_FLOOR)
}

pub(crate) fn parse_filter_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether the stream's object filter keeps a detection with this label.
/// An empty list makes `include`/`exclude` no-ops.
pub(crate) fn object_filter_allows(kind: ObjectFilterKind, list: &[String], label: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    match kind {
        ObjectFilterKind::None => true,
        ObjectFilterKind::Include => list.iter().any(|l| l == label),
        ObjectFilterKind::Exclude => !list.iter().any(|l| l == label),
    }
}

pub(crate) struct Worker<C: Clocks + Clone> {
    clocks: C,
    db: Arc<Database<C>>,
    pipeline: Arc<dyn MediaPipeline>,
    detector: Arc<dyn Detector>,
    state: Arc<StreamState>,
    storage_root: PathBuf,
    annotation_only: bool,

    /// Frames seen since the last one processed.
    frames_since_processed: u32,
    processed_any: bool,
}

impl<C: Clocks + Clone> Worker<C> {
    pub(crate) fn new(
        clocks: C,
        db: Arc<Database<C>>,
        pipeline: Arc<dyn MediaPipeline>,
        detector: Arc<dyn Detector>,
        state: Arc<StreamState>,
        storage_root: PathBuf,
        annotation_only: bool,
    ) -> Self {
        Self {
            clocks,
            db,
            pipeline,
            detector,
            state,
            storage_root,
            annotation_only,
            frames_since_processed: 0,
            processed_any: false,
        }
    }

    /// Processes one tapped frame. Returns whether it produced a triggering
    /// detection. Decimated frames return `Ok(false)` without touching the
    /// detector.
    pub(crate) fn handle_frame(&mut self, frame: &Frame) -> Result<bool, Error> {
        let name = self.state.name().to_owned();
        self.state.observe_frame(frame.data.len() as u64, frame.ts);

        let cfg = self.state.config();
        let interval = cfg.detection_interval.max(1);
        self.frames_since_processed += 1;
        if self.processed_any && self.frames_since_processed < interval {
            return Ok(false);
        }
        self.frames_since_processed = 0;
        self.processed_any = true;

        let observations = self.detector.infer(frame)?;
        let zones = self.db.lock().zones(&name)?;
        let threshold = effective_threshold(cfg.detection_threshold);
        let filter_list = parse_filter_list(&cfg.detection_object_filter_list);

        let mut triggered = false;
        for obs in observations {
            let Some(zone_id) =
                zone::evaluate(&zones, obs.x, obs.y, obs.w, obs.h, &obs.label, obs.confidence)
            else {
                continue;
            };
            if !object_filter_allows(cfg.detection_object_filter, &filter_list, &obs.label) {
                continue;
            }
            if obs.confidence >= threshold {
                triggered = true;
            }
            let d = Detection {
                timestamp: frame.ts,
                label: obs.label,
                confidence: obs.confidence,
                x: obs.x,
                y: obs.y,
                w: obs.w,
                h: obs.h,
                zone_id,
            };
            if let Err(e) = self.db.lock().insert_detection(&name, &d) {
                error!(stream = %name, err = %e.chain(), "unable to persist detection");
            }
        }
        if triggered {
            self.state.set_last_detection(frame.ts);
        }
        Ok(triggered)
    }

    /// The recording decision: a detection-triggered recording should be open
    /// iff the stream saw a triggering detection in the last
    /// [`MAX_DETECTION_AGE`] (per the persisted history) or on this frame.
    pub(crate) fn evaluate_recording(&mut self, now: jiff::Timestamp, frame_triggered: bool) {
        if self.annotation_only || self.state.is_stopping() {
            return;
        }
        let name = self.state.name().to_owned();
        let cfg = self.state.config();
        let threshold = effective_threshold(cfg.detection_threshold);
        let cutoff = now
            .checked_sub(jiff::SignedDuration::try_from(MAX_DETECTION_AGE).expect("30s fits"))
            .unwrap_or(jiff::Timestamp::MIN);
        let recent = match self.db.lock().detections_since(&name, cutoff) {
            Ok(d) => d,
            Err(e) => {
                error!(stream = %name, err = %e.chain(), "unable to query recent detections");
                return;
            }
        };
        let should_be_recording =
            frame_triggered || recent.iter().any(|d| d.confidence >= threshold);
        let recording = self.pipeline.is_recording(&name);
        if should_be_recording && !recording {
            let now_local = now.to_zoned(jiff::tz::TimeZone::system());
            let path = recording_path(&self.storage_root, &name, TriggerType::Detection, &now_local);
            info!(stream = %name, path = %path.display(), "detections present; starting recording");
            if let Err(e) = self
                .pipeline
                .start_record(&name, &cfg, TriggerType::Detection, &path)
            {
                error!(stream = %name, err = %e.chain(), "unable to start detection recording");
            }
        } else if !should_be_recording && recording {
            info!(stream = %name, "detection window expired; stopping recording");
            if let Err(e) = self.pipeline.stop_record(&name) {
                error!(stream = %name, err = %e.chain(), "unable to stop detection recording");
            }
        }
    }

    fn run(mut self, frames: mpsc::Receiver<Frame>, running: Arc<AtomicBool>, exited: Arc<AtomicBool>) {
        let name = self.state.name().to_owned();
        info!(stream = %name, annotation_only = self.annotation_only, "detection worker starting");
        while running.load(Ordering::SeqCst) {
            match self.clocks.recv_timeout(&frames, IDLE_EVALUATION_PERIOD) {
                Ok(frame) => {
                    if !self.state.callbacks_enabled() {
                        continue;
                    }
                    match self.handle_frame(&frame) {
                        Ok(triggered) => self.evaluate_recording(frame.ts, triggered),
                        Err(e) => {
                            error!(stream = %name, err = %e.chain(), "detector failed on frame; dropping it");
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.state.callbacks_enabled() {
                        self.evaluate_recording(self.clocks.realtime(), false);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    debug!(stream = %name, "frame tap closed");
                    break;
                }
            }
        }
        exited.store(true, Ordering::SeqCst);
        info!(stream = %name, "detection worker ending");
    }
}

/// Handle to a running detection worker.
pub struct WorkerHandle {
    pub annotation_only: bool,
    running: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stops the worker: polls its exit flag every 100 ms for up to 5 s, then
    /// detaches it.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            clock::join_or_detach(join, &self.exited, "detection worker");
        }
    }
}

/// Spawns a detection worker consuming `frames`.
pub(crate) fn spawn<C: Clocks + Clone>(
    worker: Worker<C>,
    frames: mpsc::Receiver<Frame>,
) -> Result<WorkerHandle, Error> {
    let running = Arc::new(AtomicBool::new(true));
    let exited = Arc::new(AtomicBool::new(false));
    let annotation_only = worker.annotation_only;
    let name = worker.state.name().to_owned();
    let join = thread::Builder::new()
        .name(format!("detect-{name}"))
        .spawn({
            let running = running.clone();
            let exited = exited.clone();
            move || worker.run(frames, running, exited)
        })
        .map_err(|e| err!(Internal, msg("unable to spawn detection worker"), source(e)))?;
    Ok(WorkerHandle {
        annotation_only,
        running,
        exited,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Call, FakePipeline};
    use base::clock::SimulatedClocks;
    use db::json::StreamConfig;
    use db::testutil::{self, TestDb, TEST_STREAM};
    use db::Zone;
    use std::collections::VecDeque;

    /// Returns scripted observations per *inference* (not per frame), then
    /// empties.
    struct ScriptedDetector {
        responses: Mutex<VecDeque<Vec<Observation>>>,
        invocations: std::sync::atomic::AtomicU32,
    }

    impl ScriptedDetector {
        fn new(responses: Vec<Vec<Observation>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                invocations: std::sync::atomic::AtomicU32::new(0),
            })
        }

        fn invocations(&self) -> u32 {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    impl Detector for ScriptedDetector {
        fn infer(&self, _frame: &Frame) -> Result<Vec<Observation>, Error> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.lock().pop_front().unwrap_or_default())
        }
    }

    fn person(confidence: f32) -> Observation {
        Observation {
            label: "person".to_owned(),
            confidence,
            x: 0.4,
            y: 0.4,
            w: 0.2,
            h: 0.2,
        }
    }

    fn frame(ts: jiff::Timestamp) -> Frame {
        Frame {
            data: vec![0; 12],
            width: 2,
            height: 2,
            ts,
        }
    }

    struct Setup {
        clocks: SimulatedClocks,
        tdb: TestDb<SimulatedClocks>,
        pipeline: Arc<FakePipeline>,
        state: Arc<StreamState>,
    }

    fn setup(configure: impl FnOnce(&mut StreamConfig)) -> Setup {
        testutil::init();
        let clocks = SimulatedClocks::new("2026-03-01T00:00:00Z".parse().unwrap());
        let tdb = TestDb::new(clocks.clone());
        let mut cfg = StreamConfig::default();
        cfg.record = false;
        cfg.detection_based_recording = true;
        cfg.detection_model = "testmodel".to_owned();
        configure(&mut cfg);
        tdb.db.lock().upsert_stream(TEST_STREAM, cfg.clone()).unwrap();
        let state = Arc::new(StreamState::new(TEST_STREAM, cfg));
        state.set_callbacks_enabled(true);
        Setup {
            clocks,
            tdb,
            pipeline: FakePipeline::new(),
            state,
        }
    }

    fn worker(s: &Setup, detector: Arc<dyn Detector>, annotation_only: bool) -> Worker<SimulatedClocks> {
        Worker::new(
            s.clocks.clone(),
            s.tdb.db.clone(),
            s.pipeline.clone(),
            detector,
            s.state.clone(),
            s.tdb.storage_root(),
            annotation_only,
        )
    }

    #[test]
    fn decimation_processes_first_then_every_nth() {
        let s = setup(|c| c.detection_interval = 5);
        let det = ScriptedDetector::new(vec![]);
        let mut w = worker(&s, det.clone(), false);
        for _ in 0..10 {
            s.clocks.sleep(Duration::from_secs(1));
            w.handle_frame(&frame(s.clocks.realtime())).unwrap();
        }
        assert_eq!(det.invocations(), 2); // first frame + one at the interval
    }

    #[test]
    fn interval_one_processes_every_frame() {
        let s = setup(|c| c.detection_interval = 1);
        let det = ScriptedDetector::new(vec![]);
        let mut w = worker(&s, det.clone(), false);
        for _ in 0..4 {
            w.handle_frame(&frame(s.clocks.realtime())).unwrap();
        }
        assert_eq!(det.invocations(), 4);
    }

    #[test]
    fn threshold_floor_clamps_low_configs() {
        assert_eq!(effective_threshold(0.2), 0.5);
        assert_eq!(effective_threshold(0.5), 0.5);
        assert_eq!(effective_threshold(0.8), 0.8);

        // A 0.4-confidence detection doesn't trigger even with threshold 0.2.
        let s = setup(|c| {
            c.detection_threshold = 0.2;
            c.detection_interval = 1;
        });
        let det = ScriptedDetector::new(vec![vec![person(0.4)], vec![person(0.6)]]);
        let mut w = worker(&s, det, false);
        assert!(!w.handle_frame(&frame(s.clocks.realtime())).unwrap());
        assert!(w.handle_frame(&frame(s.clocks.realtime())).unwrap());
    }

    #[test]
    fn object_filter_rules() {
        let list = parse_filter_list("person, car");
        assert_eq!(list, vec!["person", "car"]);
        assert!(object_filter_allows(ObjectFilterKind::None, &list, "dog"));
        assert!(object_filter_allows(ObjectFilterKind::Include, &list, "car"));
        assert!(!object_filter_allows(ObjectFilterKind::Include, &list, "dog"));
        assert!(!object_filter_allows(ObjectFilterKind::Exclude, &list, "car"));
        assert!(object_filter_allows(ObjectFilterKind::Exclude, &list, "dog"));
        // Empty list: filters are no-ops.
        assert!(object_filter_allows(ObjectFilterKind::Include, &[], "dog"));
    }

    #[test]
    fn exclude_filter_drops_detection_rows() {
        let s = setup(|c| {
            c.detection_interval = 1;
            c.detection_object_filter = ObjectFilterKind::Exclude;
            c.detection_object_filter_list = "person".to_owned();
        });
        let det = ScriptedDetector::new(vec![vec![person(0.9)]]);
        let mut w = worker(&s, det, false);
        assert!(!w.handle_frame(&frame(s.clocks.realtime())).unwrap());
        let rows = s
            .tdb
            .db
            .lock()
            .detections_since(TEST_STREAM, jiff::Timestamp::MIN)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn zone_tags_survivors_and_drops_outsiders() {
        let s = setup(|c| c.detection_interval = 1);
        let zone_id = s
            .tdb
            .db
            .lock()
            .upsert_zone(
                TEST_STREAM,
                &Zone {
                    id: 0,
                    name: "porch".to_owned(),
                    enabled: true,
                    points: vec![[0.25, 0.25], [0.75, 0.25], [0.75, 0.75], [0.25, 0.75]],
                    classes: vec![],
                    min_confidence: 0.0,
                },
            )
            .unwrap();
        // One centered (kept, tagged), one at the edge (dropped).
        let outside = Observation {
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
            ..person(0.9)
        };
        let det = ScriptedDetector::new(vec![vec![person(0.9), outside]]);
        let mut w = worker(&s, det, false);
        w.handle_frame(&frame(s.clocks.realtime())).unwrap();
        let rows = s
            .tdb
            .db
            .lock()
            .detections_since(TEST_STREAM, jiff::Timestamp::MIN)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].zone_id, Some(zone_id));
    }

    /// The end-to-end policy walk: detections at t=0 and t=5 open a
    /// recording; the recording closes once the 30 s window runs dry.
    #[test]
    fn detection_only_opens_and_closes_recording() {
        let s = setup(|c| {
            c.detection_threshold = 0.6;
            c.detection_interval = 5;
        });
        let det = ScriptedDetector::new(vec![vec![person(0.75)], vec![person(0.75)]]);
        let mut w = worker(&s, det, false);

        for t in 0..10 {
            let f = frame(s.clocks.realtime());
            let triggered = w.handle_frame(&f).unwrap();
            assert_eq!(triggered, t == 0 || t == 5, "frame {t}");
            w.evaluate_recording(f.ts, triggered);
            if t == 5 {
                assert!(s.pipeline.is_recording(TEST_STREAM), "open by t=5");
            }
            s.clocks.sleep(Duration::from_secs(1));
        }
        assert!(s.pipeline.is_recording(TEST_STREAM));
        let calls = s.pipeline.take_calls();
        let starts: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::StartRecord(stream, trigger, path) => Some((stream, trigger, path)),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(*starts[0].1, TriggerType::Detection);
        let path = starts[0].2.to_string_lossy();
        assert!(path.contains("recordings/test/detection_"), "{path}");

        // t=10..34: window still contains the t=5 detection until t=35.
        s.clocks.sleep(Duration::from_secs(24)); // now at t=34
        w.evaluate_recording(s.clocks.realtime(), false);
        assert!(s.pipeline.is_recording(TEST_STREAM), "still open at t=34");

        s.clocks.sleep(Duration::from_secs(2)); // t=36 > 5+30
        w.evaluate_recording(s.clocks.realtime(), false);
        assert!(!s.pipeline.is_recording(TEST_STREAM), "closed after window");
        assert_eq!(
            s.pipeline.take_calls(),
            vec![Call::StopRecord(TEST_STREAM.to_owned())]
        );
    }

    #[test]
    fn annotation_only_never_starts_or_stops() {
        let s = setup(|c| c.detection_interval = 1);
        let det = ScriptedDetector::new(vec![vec![person(0.9)]]);
        let mut w = worker(&s, det, true);
        let f = frame(s.clocks.realtime());
        let triggered = w.handle_frame(&f).unwrap();
        assert!(triggered);
        w.evaluate_recording(f.ts, triggered);
        assert!(s.pipeline.calls().iter().all(|c| !matches!(
            c,
            Call::StartRecord(..) | Call::StopRecord(..)
        )));
        // Detections are still persisted for reporting.
        assert_eq!(
            s.tdb
                .db
                .lock()
                .detections_since(TEST_STREAM, jiff::Timestamp::MIN)
                .unwrap()
                .len(),
            1
        );
        // And the stream remembers its last triggering detection.
        assert_eq!(s.state.last_detection(), Some(f.ts));
    }

    #[test]
    fn registry_lookup() {
        let reg = DetectorRegistry::default();
        assert_eq!(
            reg.get("missing").unwrap_err().kind(),
            base::ErrorKind::Unimplemented
        );
        reg.register("testmodel", ScriptedDetector::new(vec![]));
        reg.get("testmodel").unwrap();
    }
}
