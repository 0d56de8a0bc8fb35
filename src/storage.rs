// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The storage lifecycle controller: deleting old recordings and keeping the
//! disk from silently overfilling.
//!
//! One background worker owns every deletion decision. It blocks on a command
//! channel with the heartbeat period as timeout, so a `trigger_cleanup` call
//! wakes it immediately and an idle minute runs the heartbeat. Three cycles
//! run at fixed periods:
//!
//! * heartbeat (60 s): statvfs the storage root, reclassify pressure,
//!   publish changes, escalate if needed.
//! * standard (15 min): per-stream time-based retention, quota enforcement,
//!   tiered retention, then the safety-interlocked orphan pass and a summary
//!   cache refresh.
//! * deep (6 h): session/detection reaping plus a full standard cycle.
//!
//! Emergency cleanup runs on demand: when the heartbeat sees free space below
//! the emergency threshold, or when forced through [`StorageController::trigger_cleanup`].

use crate::bus::{Bus, TOPIC_STORAGE_CLEANUP, TOPIC_STORAGE_PRESSURE};
use base::clock::{self, Clocks, Instant};
use base::shutdown;
use base::strutil::encode_size;
use base::{err, Error, Mutex};
use db::{Database, Recording, RetentionPolicy, RetentionTier};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Max recordings deleted per stream per pass per cycle.
const RETENTION_BATCH: usize = 100;

/// Max orphan candidates examined per cycle.
const ORPHAN_BATCH: usize = 100;

/// The orphan interlock refuses to act when more than half the checked rows
/// are orphans and at least this many rows were checked.
const ORPHAN_MIN_CHECKED: usize = 10;

const EMERGENCY_BATCH: usize = 100;
const EMERGENCY_BATCH_AGGRESSIVE: usize = 200;

/// Categorical free-space classification driving cleanup behavior.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
    Emergency,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Elevated => "elevated",
            PressureLevel::Critical => "critical",
            PressureLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-space percentage floors for each pressure level.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct PressureThresholds {
    pub normal_min_pct: f64,
    pub elevated_min_pct: f64,
    pub critical_min_pct: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            normal_min_pct: 20.0,
            elevated_min_pct: 10.0,
            critical_min_pct: 5.0,
        }
    }
}

/// Pure classification of a free-space percentage.
pub fn classify_pressure(free_pct: f64, t: &PressureThresholds) -> PressureLevel {
    if free_pct >= t.normal_min_pct {
        PressureLevel::Normal
    } else if free_pct >= t.elevated_min_pct {
        PressureLevel::Elevated
    } else if free_pct >= t.critical_min_pct {
        PressureLevel::Critical
    } else {
        PressureLevel::Emergency
    }
}

/// Cached snapshot of storage state, updated only by the controller.
#[derive(Clone, Debug)]
pub struct StorageHealth {
    pub pressure: PressureLevel,
    pub free_pct: f64,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub last_check: Option<jiff::Timestamp>,
    pub last_cleanup: Option<jiff::Timestamp>,
    pub last_deep: Option<jiff::Timestamp>,
    pub last_cleanup_deleted: u64,
    pub last_cleanup_freed: u64,
}

impl Default for StorageHealth {
    fn default() -> Self {
        Self {
            pressure: PressureLevel::Normal,
            free_pct: 100.0,
            free_bytes: 0,
            total_bytes: 0,
            used_bytes: 0,
            last_check: None,
            last_cleanup: None,
            last_deep: None,
            last_cleanup_deleted: 0,
            last_cleanup_freed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Free-space probing, behind a trait so tests can script it.
pub trait DiskUsage: Send + Sync + 'static {
    fn usage(&self, path: &Path) -> Result<DiskStats, Error>;
}

/// The real thing: statvfs(3).
pub struct StatvfsDisk;

impl DiskUsage for StatvfsDisk {
    fn usage(&self, path: &Path) -> Result<DiskStats, Error> {
        let s = nix::sys::statvfs::statvfs(path)
            .map_err(|e| err!(Unavailable, msg("statvfs {} failed", path.display()), source(e)))?;
        let frag = s.fragment_size() as u64;
        Ok(DiskStats {
            total_bytes: s.blocks() as u64 * frag,
            free_bytes: s.blocks_available() as u64 * frag,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub storage_root: PathBuf,
    pub heartbeat_period: Duration,
    pub standard_period: Duration,
    pub deep_period: Duration,
    pub thresholds: PressureThresholds,
}

impl Options {
    pub fn new(storage_root: PathBuf) -> Self {
        Self {
            storage_root,
            heartbeat_period: Duration::from_secs(60),
            standard_period: Duration::from_secs(15 * 60),
            deep_period: Duration::from_secs(6 * 60 * 60),
            thresholds: PressureThresholds::default(),
        }
    }
}

enum Command {
    Cleanup { aggressive: bool },
    Shutdown,
}

struct Shared<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    bus: Bus,
    disk: Arc<dyn DiskUsage>,
    opts: Options,
    health: Mutex<StorageHealth>,
    running: AtomicBool,
    exited: Arc<AtomicBool>,
    shutdown_rx: shutdown::Receiver,
}

/// Handle to the storage controller. All methods are thread-safe and return
/// quickly; the work happens on the controller's own thread.
pub struct StorageController<C: Clocks + Clone> {
    shared: Arc<Shared<C>>,
    cmd_tx: mpsc::Sender<Command>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<C: Clocks + Clone> std::fmt::Debug for StorageController<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageController").finish_non_exhaustive()
    }
}

impl<C: Clocks + Clone> StorageController<C> {
    /// Spawns the controller thread. Fails if the storage root is not an
    /// existing directory; that is a misconfiguration which must surface at
    /// startup rather than be misread later as mass orphaning.
    pub fn start(
        db: Arc<Database<C>>,
        bus: Bus,
        disk: Arc<dyn DiskUsage>,
        opts: Options,
        shutdown_rx: shutdown::Receiver,
    ) -> Result<Self, Error> {
        if !opts.storage_root.is_dir() {
            return Err(err!(
                FailedPrecondition,
                msg("storage root {} is not a directory", opts.storage_root.display())
            ));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            db,
            bus,
            disk,
            opts,
            health: Mutex::new(StorageHealth::default()),
            running: AtomicBool::new(true),
            exited: Arc::new(AtomicBool::new(false)),
            shutdown_rx,
        });
        let worker = Worker {
            shared: shared.clone(),
            cmd_rx,
            last_heartbeat: None,
            last_standard: None,
            last_deep: None,
        };
        let join = thread::Builder::new()
            .name("storage".to_owned())
            .spawn(move || worker.run())
            .map_err(|e| err!(Internal, msg("unable to spawn storage thread"), source(e)))?;
        Ok(Self {
            shared,
            cmd_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Thread-safe copy of the cached storage state.
    pub fn health_snapshot(&self) -> StorageHealth {
        self.shared.health.lock().clone()
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.shared.health.lock().pressure
    }

    /// Requests a cleanup and returns immediately. `aggressive` runs an
    /// emergency pass; otherwise a standard cycle runs out of schedule.
    pub fn trigger_cleanup(&self, aggressive: bool) {
        if self.cmd_tx.send(Command::Cleanup { aggressive }).is_err() {
            warn!("storage controller is gone; dropping cleanup request");
        }
    }

    /// Stops the worker: polls its exit flag every 100 ms for up to 5 s, then
    /// detaches it.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(join) = self.join.lock().take() {
            clock::join_or_detach(join, &self.shared.exited, "storage controller");
        }
    }
}

/// Totals from one cleanup cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CycleStats {
    deleted: u64,
    tier_deleted: u64,
    orphans_removed: u64,
    freed_bytes: u64,
    errors: u64,
}

fn due(last: Option<Instant>, now: Instant, period: Duration) -> bool {
    last.map_or(true, |l| now.saturating_since(l) >= period)
}

struct Worker<C: Clocks + Clone> {
    shared: Arc<Shared<C>>,
    cmd_rx: mpsc::Receiver<Command>,
    last_heartbeat: Option<Instant>,
    last_standard: Option<Instant>,
    last_deep: Option<Instant>,
}

impl<C: Clocks + Clone> Worker<C> {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.shared.shutdown_rx.check().is_ok()
    }

    fn run(mut self) {
        info!("starting");
        let clocks = self.shared.db.clocks();
        while self.running() {
            match clocks.recv_timeout(&self.cmd_rx, self.shared.opts.heartbeat_period) {
                Ok(Command::Shutdown) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Ok(Command::Cleanup { aggressive }) => {
                    if !self.running() {
                        break;
                    }
                    if aggressive {
                        self.emergency_cleanup(true);
                    } else {
                        self.standard_cycle();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            if !self.running() {
                break;
            }
            let now = clocks.monotonic();
            if due(self.last_heartbeat, now, self.shared.opts.heartbeat_period) {
                let level = self.heartbeat();
                self.escalate(level);
            }
            let now = clocks.monotonic();
            if due(self.last_deep, now, self.shared.opts.deep_period) {
                self.deep_cycle();
            } else if due(self.last_standard, now, self.shared.opts.standard_period) {
                self.standard_cycle();
            }
        }
        self.shared.exited.store(true, Ordering::SeqCst);
        info!("ending");
    }

    /// Probes free space, updates the health snapshot, and publishes a
    /// pressure event iff the level changed. Returns the current level.
    fn heartbeat(&mut self) -> PressureLevel {
        let clocks = self.shared.db.clocks();
        self.last_heartbeat = Some(clocks.monotonic());
        let stats = match self.shared.disk.usage(&self.shared.opts.storage_root) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e.chain(), "free-space probe failed; keeping previous pressure");
                return self.shared.health.lock().pressure;
            }
        };
        let free_pct = if stats.total_bytes == 0 {
            100.0
        } else {
            stats.free_bytes as f64 / stats.total_bytes as f64 * 100.0
        };
        let level = classify_pressure(free_pct, &self.shared.opts.thresholds);
        let prev;
        {
            let mut h = self.shared.health.lock();
            prev = h.pressure;
            h.pressure = level;
            h.free_pct = free_pct;
            h.free_bytes = stats.free_bytes;
            h.total_bytes = stats.total_bytes;
            h.used_bytes = stats.total_bytes.saturating_sub(stats.free_bytes);
            h.last_check = Some(clocks.realtime());
        }
        if level != prev {
            info!(%prev, current = %level, free_pct, "storage pressure changed");
            self.shared.bus.publish(
                TOPIC_STORAGE_PRESSURE,
                serde_json::json!({
                    "previous": prev.as_str(),
                    "current": level.as_str(),
                    "free_pct": free_pct,
                    "free_mb": stats.free_bytes >> 20,
                    "total_mb": stats.total_bytes >> 20,
                }),
                true,
            );
        }
        level
    }

    /// Post-heartbeat escalation: emergency pressure reclaims immediately;
    /// critical pressure pulls the next standard cycle forward once a third
    /// of its period has elapsed.
    fn escalate(&mut self, level: PressureLevel) {
        match level {
            PressureLevel::Emergency => self.emergency_cleanup(true),
            PressureLevel::Critical => {
                let now = self.shared.db.clocks().monotonic();
                if due(self.last_standard, now, self.shared.opts.standard_period / 3) {
                    info!("critical pressure; running standard cycle early");
                    self.standard_cycle();
                }
            }
            _ => {}
        }
    }

    fn standard_cycle(&mut self) -> CycleStats {
        let clocks = self.shared.db.clocks();
        let start = clocks.monotonic();
        self.last_standard = Some(start);
        let mut stats = CycleStats::default();

        let (streams, global_retention_days) = {
            let l = self.shared.db.lock();
            (
                l.streams().clone(),
                l.global().retention_days,
            )
        };
        for (name, cfg) in &streams {
            if !self.running() {
                break;
            }
            let policy = RetentionPolicy::effective(cfg, global_retention_days);
            if policy.is_noop() {
                debug!(stream = %name, "all retention knobs off; skipping");
                continue;
            }
            if let Err(e) = self.retention_pass(name, &policy, &mut stats) {
                stats.errors += 1;
                error!(stream = %name, err = %e.chain(), "time-based retention pass failed");
            }
            if let Err(e) = self.quota_pass(name, &policy, &mut stats) {
                stats.errors += 1;
                error!(stream = %name, err = %e.chain(), "quota pass failed");
            }
            if let Err(e) = self.tiered_pass(name, &policy, &mut stats) {
                stats.errors += 1;
                error!(stream = %name, err = %e.chain(), "tiered retention pass failed");
            }
        }

        if let Err(e) = self.orphan_pass(&mut stats) {
            stats.errors += 1;
            error!(err = %e.chain(), "orphan pass failed");
        }

        if let Err(e) = self.shared.db.lock().refresh_storage_summaries() {
            stats.errors += 1;
            error!(err = %e.chain(), "summary cache refresh failed");
        }

        let elapsed = clocks.monotonic().saturating_since(start);
        let pressure;
        {
            let mut h = self.shared.health.lock();
            h.last_cleanup = Some(clocks.realtime());
            h.last_cleanup_deleted = stats.deleted;
            h.last_cleanup_freed = stats.freed_bytes;
            pressure = h.pressure;
        }
        if stats.deleted > 0 {
            info!(
                deleted = stats.deleted,
                tier_deleted = stats.tier_deleted,
                freed = %encode_size(stats.freed_bytes as i64),
                ?elapsed,
                "cleanup cycle finished"
            );
            self.shared.bus.publish(
                TOPIC_STORAGE_CLEANUP,
                serde_json::json!({
                    "deleted": stats.deleted,
                    "tier_deleted": stats.tier_deleted,
                    "freed_bytes": stats.freed_bytes,
                    "elapsed_sec": elapsed.as_secs_f64(),
                    "pressure": pressure.as_str(),
                }),
                false,
            );
        }
        stats
    }

    /// Session/detection reaping plus a full standard cycle.
    fn deep_cycle(&mut self) {
        let clocks = self.shared.db.clocks();
        self.last_deep = Some(clocks.monotonic());
        let now = clocks.realtime();

        match self.shared.db.lock().delete_expired_sessions(now) {
            Ok(0) => {}
            Ok(n) => info!(sessions = n, "reaped expired sessions"),
            Err(e) => error!(err = %e.chain(), "session cleanup failed"),
        }

        let (streams, global_retention_days) = {
            let l = self.shared.db.lock();
            (l.streams().clone(), l.global().retention_days)
        };
        for (name, cfg) in &streams {
            if !self.running() {
                break;
            }
            let policy = RetentionPolicy::effective(cfg, global_retention_days);
            if policy.detection_retention_days == 0 {
                continue;
            }
            let cutoff = days_ago(now, policy.detection_retention_days as f64);
            match self.shared.db.lock().delete_detections_before(name, cutoff) {
                Ok(0) => {}
                Ok(n) => debug!(stream = %name, detections = n, "pruned old detections"),
                Err(e) => error!(stream = %name, err = %e.chain(), "detection pruning failed"),
            }
        }

        self.standard_cycle();
        self.shared.health.lock().last_deep = Some(now);
    }

    /// Time-based retention: deletes up to [`RETENTION_BATCH`] recordings per
    /// stream older than the applicable horizon.
    fn retention_pass(
        &mut self,
        name: &str,
        policy: &RetentionPolicy,
        stats: &mut CycleStats,
    ) -> Result<(), Error> {
        let now = self.shared.db.clocks().realtime();
        let regular_cutoff =
            (policy.retention_days > 0).then(|| days_ago(now, policy.retention_days as f64));
        let detection_cutoff = (policy.detection_retention_days > 0)
            .then(|| days_ago(now, policy.detection_retention_days as f64));
        if regular_cutoff.is_none() && detection_cutoff.is_none() {
            return Ok(());
        }
        let recordings = self.shared.db.lock().recordings_for_retention(
            name,
            regular_cutoff,
            detection_cutoff,
            RETENTION_BATCH,
        )?;
        for r in recordings {
            if !self.running() {
                break;
            }
            match self.delete_recording(&r) {
                Ok(freed) => {
                    stats.deleted += 1;
                    stats.freed_bytes += freed;
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(stream = %name, id = r.id, err = %e.chain(), "unable to delete expired recording");
                }
            }
        }
        Ok(())
    }

    /// Quota enforcement: deletes the oldest unprotected recordings until the
    /// stream is back under its byte budget or the batch is exhausted.
    fn quota_pass(
        &mut self,
        name: &str,
        policy: &RetentionPolicy,
        stats: &mut CycleStats,
    ) -> Result<(), Error> {
        if policy.max_storage_mb == 0 {
            return Ok(());
        }
        let limit_bytes = policy.max_storage_mb * 1024 * 1024;
        let usage = self.shared.db.lock().stream_storage_bytes(name)?;
        if usage <= limit_bytes {
            return Ok(());
        }
        let overage = usage - limit_bytes;
        info!(
            stream = %name,
            usage = %encode_size(usage as i64),
            limit = %encode_size(limit_bytes as i64),
            "over quota; evicting oldest recordings"
        );
        let recordings = self
            .shared
            .db
            .lock()
            .recordings_for_quota(name, RETENTION_BATCH)?;
        let mut freed: u64 = 0;
        for r in recordings {
            if !self.running() || freed >= overage {
                break;
            }
            match self.delete_recording(&r) {
                Ok(f) => {
                    freed += f;
                    stats.deleted += 1;
                    stats.freed_bytes += f;
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(stream = %name, id = r.id, err = %e.chain(), "unable to evict recording");
                }
            }
        }
        Ok(())
    }

    /// Tiered retention: each tier's horizon is the base period scaled by the
    /// stream's multiplier for that tier.
    fn tiered_pass(
        &mut self,
        name: &str,
        policy: &RetentionPolicy,
        stats: &mut CycleStats,
    ) -> Result<(), Error> {
        if policy.retention_days == 0 {
            return Ok(());
        }
        let now = self.shared.db.clocks().realtime();
        let base = policy.retention_days as f64;
        let mut cutoffs = [jiff::Timestamp::MIN; 4];
        for (i, tier) in RetentionTier::ALL.iter().enumerate() {
            let mult = policy.tier_multipliers[*tier as usize];
            cutoffs[i] = days_ago(now, base * mult);
        }
        let recordings = self.shared.db.lock().recordings_for_tiered_retention(
            name,
            &cutoffs,
            RETENTION_BATCH,
        )?;
        for r in recordings {
            if !self.running() {
                break;
            }
            match self.delete_recording(&r) {
                Ok(freed) => {
                    stats.deleted += 1;
                    stats.tier_deleted += 1;
                    stats.freed_bytes += freed;
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(stream = %name, id = r.id, tier = %r.tier, err = %e.chain(),
                           "unable to delete tier-expired recording");
                }
            }
        }
        Ok(())
    }

    /// Orphan reconciliation: removes metadata rows whose files are gone,
    /// behind two interlocks. A missing storage root or `mp4/` subdirectory
    /// means the mount is gone, not that everything was deleted; and a
    /// majority of orphans across a meaningful sample means the same.
    fn orphan_pass(&mut self, stats: &mut CycleStats) -> Result<(), Error> {
        let root = &self.shared.opts.storage_root;
        if !root.is_dir() || !root.join("mp4").is_dir() {
            error!(
                root = %root.display(),
                "storage root or its mp4/ subdirectory is missing; skipping orphan pass"
            );
            return Ok(());
        }
        let (orphans, checked) = self.shared.db.lock().orphaned_recordings(ORPHAN_BATCH)?;
        if orphans.is_empty() {
            return Ok(());
        }
        if checked >= ORPHAN_MIN_CHECKED && orphans.len() * 2 > checked {
            error!(
                orphans = orphans.len(),
                checked, "orphan ratio exceeds 50%; refusing to reconcile"
            );
            return Ok(());
        }
        for r in orphans {
            if !self.running() {
                break;
            }
            // Files are gone by definition; only rows (and stray thumbnails)
            // need removal.
            match self.delete_recording(&r) {
                Ok(_) => {
                    stats.deleted += 1;
                    stats.orphans_removed += 1;
                    info!(stream = %r.stream_name, path = %r.file_path.display(), "removed orphaned metadata row");
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(id = r.id, err = %e.chain(), "unable to remove orphaned row");
                }
            }
        }
        Ok(())
    }

    /// Pressure-driven reclamation, most expendable recordings first. Runs
    /// until the eligibility list is exhausted or shutdown is signalled, then
    /// refreshes the pressure reading.
    fn emergency_cleanup(&mut self, aggressive: bool) {
        let limit = if aggressive {
            EMERGENCY_BATCH_AGGRESSIVE
        } else {
            EMERGENCY_BATCH
        };
        warn!(aggressive, "emergency cleanup starting");
        let recordings = match self.shared.db.lock().recordings_for_pressure(limit) {
            Ok(r) => r,
            Err(e) => {
                error!(err = %e.chain(), "unable to list pressure-eligible recordings");
                return;
            }
        };
        let mut deleted: u64 = 0;
        let mut freed: u64 = 0;
        for r in recordings {
            if !self.running() {
                break;
            }
            match self.delete_recording(&r) {
                Ok(f) => {
                    deleted += 1;
                    freed += f;
                }
                Err(e) => {
                    error!(id = r.id, err = %e.chain(), "unable to delete recording under pressure");
                }
            }
        }
        warn!(
            deleted,
            freed = %encode_size(freed as i64),
            "emergency cleanup finished"
        );
        {
            let mut h = self.shared.health.lock();
            h.last_cleanup = Some(self.shared.db.clocks().realtime());
            h.last_cleanup_deleted = deleted;
            h.last_cleanup_freed = freed;
        }
        if let Err(e) = self.shared.db.lock().refresh_storage_summaries() {
            error!(err = %e.chain(), "summary cache refresh failed");
        }
        self.heartbeat();
    }

    /// Deletes one recording: its file (ENOENT tolerated), its thumbnails,
    /// then its metadata row. Any other unlink failure leaves the row in
    /// place. Returns the bytes freed.
    fn delete_recording(&self, r: &Recording) -> Result<u64, Error> {
        debug_assert!(!r.protected, "protected recordings are excluded at query level");
        match std::fs::remove_file(&r.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %r.file_path.display(), "file already gone");
            }
            Err(e) => {
                return Err(err!(
                    Unavailable,
                    msg("unable to unlink {}", r.file_path.display()),
                    source(e)
                ));
            }
        }
        let thumbnails = self.shared.db.lock().thumbnails_for_recording(r.id)?;
        for t in thumbnails {
            match std::fs::remove_file(&t) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %t.display(), "unable to unlink thumbnail: {e}"),
            }
        }
        self.shared.db.lock().delete_recording(r.id)?;
        Ok(r.size_bytes.max(0) as u64)
    }
}

/// `now - days`, clamped so an out-of-range result matches nothing.
fn days_ago(now: jiff::Timestamp, days: f64) -> jiff::Timestamp {
    let secs = days * 86400.0;
    if !secs.is_finite() {
        return jiff::Timestamp::MIN;
    }
    jiff::SignedDuration::try_from_secs_f64(secs)
        .ok()
        .and_then(|d| now.checked_sub(d).ok())
        .unwrap_or(jiff::Timestamp::MIN)
}
