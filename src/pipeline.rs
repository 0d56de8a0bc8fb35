// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The media pipeline seam: HLS publishing, MP4 recording, and the raw frame
//! tap consumed by the detection worker.
//!
//! The core never touches container or codec internals; [`FfmpegPipeline`]
//! delegates all of that to `ffmpeg` child processes, one per subsystem per
//! stream. Anything implementing [`MediaPipeline`] can stand in for it, which
//! is how the supervisor and detection tests run without cameras.

use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap, Mutex};
use db::json::StreamConfig;
use db::{Database, RecordingToInsert, RetentionTier, TriggerType};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{debug, error, info, warn};

/// Dimensions of frames delivered by the frame tap. Detectors rescale to
/// whatever their model wants; this just bounds the tap's bandwidth.
pub const TAP_WIDTH: u32 = 320;
pub const TAP_HEIGHT: u32 = 240;

/// Frames per second requested from the tap when the stream has no
/// `frame_rate_hint`.
const DEFAULT_TAP_FPS: f32 = 5.0;

/// One decoded RGB24 frame from a stream's tap.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub ts: jiff::Timestamp,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("ts", &self.ts)
            .finish()
    }
}

/// Control surface of the external media machinery for one process.
///
/// All calls are synchronous and must not be made while holding a stream
/// state mutex. Implementations are expected to make `stop_*` and repeated
/// `start_*` calls cheap no-ops when the subsystem is already in the
/// requested state.
pub trait MediaPipeline: Send + Sync + 'static {
    fn start_hls(&self, stream: &str, cfg: &StreamConfig) -> Result<(), Error>;
    fn stop_hls(&self, stream: &str) -> Result<(), Error>;

    /// Starts an MP4 recording at `path`, creating parent directories and the
    /// recording's metadata row.
    fn start_record(
        &self,
        stream: &str,
        cfg: &StreamConfig,
        trigger: TriggerType,
        path: &Path,
    ) -> Result<(), Error>;

    /// Stops an open recording and finalizes its metadata row's size.
    fn stop_record(&self, stream: &str) -> Result<(), Error>;

    /// Whether a recording has been started and not stopped, regardless of
    /// writer health.
    fn is_recording(&self, stream: &str) -> bool;

    /// Whether the MP4 writer process is actually alive.
    fn writer_alive(&self, stream: &str) -> bool;

    /// Starts delivering decoded frames for the stream. At most one tap per
    /// stream; a second call replaces the first.
    fn start_frame_tap(&self, stream: &str, cfg: &StreamConfig)
        -> Result<mpsc::Receiver<Frame>, Error>;

    fn stop_frame_tap(&self, stream: &str);
}

/// Returns `{storage_root}/recordings/{stream}/{trigger}_{YYYYmmdd_HHMMSS}.mp4`
/// for a recording starting at `now` (local time).
pub fn recording_path(
    storage_root: &Path,
    stream: &str,
    trigger: TriggerType,
    now: &jiff::Zoned,
) -> PathBuf {
    storage_root
        .join("recordings")
        .join(stream)
        .join(format!(
            "{}_{}.mp4",
            trigger.as_str(),
            now.strftime("%Y%m%d_%H%M%S")
        ))
}

struct RecordProc {
    child: Child,
    recording_id: i64,
    path: PathBuf,
}

struct TapProc {
    child: Child,
    stop: Arc<AtomicBool>,
}

#[derive(Default)]
struct StreamProcs {
    hls: Option<Child>,
    record: Option<RecordProc>,
    tap: Option<TapProc>,
}

/// [`MediaPipeline`] implementation which shells out to `ffmpeg`.
pub struct FfmpegPipeline<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    hls_root: PathBuf,
    streams: Mutex<FastHashMap<String, StreamProcs>>,
}

impl<C: Clocks + Clone> FfmpegPipeline<C> {
    pub fn new(db: Arc<Database<C>>, storage_root: PathBuf, hls_root: Option<PathBuf>) -> Self {
        let hls_root = hls_root.unwrap_or_else(|| storage_root.join("hls"));
        Self {
            db,
            hls_root,
            streams: Mutex::new(FastHashMap::default()),
        }
    }

    fn source_url<'c>(stream: &str, cfg: &'c StreamConfig) -> Result<&'c url::Url, Error> {
        cfg.source_url
            .as_ref()
            .ok_or_else(|| err!(FailedPrecondition, msg("stream {stream} has no source_url")))
    }

    fn input_args(cmd: &mut Command, url: &url::Url) {
        cmd.arg("-nostdin").arg("-loglevel").arg("warning");
        if url.scheme() == "rtsp" {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i").arg(url.as_str());
    }
}

fn child_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Asks a child `ffmpeg` to finish cleanly (SIGTERM makes it write the moov
/// box), then reaps it.
fn stop_child(mut child: Child, what: &str) {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
        debug!("{what}: SIGTERM failed (process likely already gone): {e}");
    }
    match child.wait() {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("{what}: exited with {status}"),
        Err(e) => warn!("{what}: wait failed: {e}"),
    }
}

impl<C: Clocks + Clone> MediaPipeline for FfmpegPipeline<C> {
    fn start_hls(&self, stream: &str, cfg: &StreamConfig) -> Result<(), Error> {
        let mut l = self.streams.lock();
        let procs = l.entry(stream.to_owned()).or_default();
        if let Some(child) = &mut procs.hls {
            if child_alive(child) {
                return Ok(());
            }
        }
        let url = Self::source_url(stream, cfg)?;
        let dir = self.hls_root.join(stream);
        std::fs::create_dir_all(&dir)
            .map_err(|e| err!(Internal, msg("unable to create {}", dir.display()), source(e)))?;
        let mut cmd = Command::new("ffmpeg");
        Self::input_args(&mut cmd, url);
        cmd.arg("-c").arg("copy");
        cmd.arg("-f").arg("hls");
        cmd.arg("-hls_time").arg("2");
        cmd.arg("-hls_list_size").arg("10");
        cmd.arg("-hls_flags").arg("delete_segments+append_list");
        cmd.arg(dir.join("index.m3u8"));
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd
            .spawn()
            .map_err(|e| err!(Unavailable, msg("unable to spawn ffmpeg for hls"), source(e)))?;
        info!(stream, pid = child.id(), "hls publisher started");
        procs.hls = Some(child);
        Ok(())
    }

    fn stop_hls(&self, stream: &str) -> Result<(), Error> {
        let child = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|p| p.hls.take());
        if let Some(child) = child {
            stop_child(child, "hls");
            info!(stream, "hls publisher stopped");
        }
        Ok(())
    }

    fn start_record(
        &self,
        stream: &str,
        cfg: &StreamConfig,
        trigger: TriggerType,
        path: &Path,
    ) -> Result<(), Error> {
        let mut l = self.streams.lock();
        let procs = l.entry(stream.to_owned()).or_default();
        if let Some(r) = &mut procs.record {
            if child_alive(&mut r.child) {
                return Ok(());
            }
        }
        if let Some(r) = procs.record.take() {
            // The writer died without a stop; finalize what it left behind.
            finalize(&self.db, r);
        }
        let url = Self::source_url(stream, cfg)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                err!(Internal, msg("unable to create {}", parent.display()), source(e))
            })?;
        }
        let mut cmd = Command::new("ffmpeg");
        Self::input_args(&mut cmd, url);
        cmd.arg("-c").arg("copy");
        cmd.arg("-movflags").arg("+faststart");
        cmd.arg(path);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd
            .spawn()
            .map_err(|e| err!(Unavailable, msg("unable to spawn ffmpeg for mp4"), source(e)))?;
        let recording_id = self.db.lock().insert_recording(&RecordingToInsert {
            stream_name: stream.to_owned(),
            file_path: path.to_owned(),
            size_bytes: 0,
            created_at: self.db.clocks().realtime(),
            trigger,
            tier: RetentionTier::Standard,
            protected: false,
        })?;
        info!(stream, %trigger, path = %path.display(), "recording started");
        procs.record = Some(RecordProc {
            child,
            recording_id,
            path: path.to_owned(),
        });
        Ok(())
    }

    fn stop_record(&self, stream: &str) -> Result<(), Error> {
        let r = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|p| p.record.take());
        let Some(r) = r else {
            return Ok(()); // already stopped.
        };
        stop_child(r.child, "mp4 writer");
        let (recording_id, path) = (r.recording_id, r.path);
        let size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);
        self.db.lock().finalize_recording(recording_id, size)?;
        info!(stream, size, path = %path.display(), "recording stopped");
        Ok(())
    }

    fn is_recording(&self, stream: &str) -> bool {
        self.streams
            .lock()
            .get(stream)
            .map(|p| p.record.is_some())
            .unwrap_or(false)
    }

    fn writer_alive(&self, stream: &str) -> bool {
        self.streams
            .lock()
            .get_mut(stream)
            .and_then(|p| p.record.as_mut())
            .map(|r| child_alive(&mut r.child))
            .unwrap_or(false)
    }

    fn start_frame_tap(
        &self,
        stream: &str,
        cfg: &StreamConfig,
    ) -> Result<mpsc::Receiver<Frame>, Error> {
        self.stop_frame_tap(stream);
        let url = Self::source_url(stream, cfg)?;
        let fps = if cfg.frame_rate_hint > 0.0 {
            cfg.frame_rate_hint.min(30.0)
        } else {
            DEFAULT_TAP_FPS
        };
        let mut cmd = Command::new("ffmpeg");
        Self::input_args(&mut cmd, url);
        cmd.arg("-vf")
            .arg(format!("fps={fps},scale={TAP_WIDTH}:{TAP_HEIGHT}"));
        cmd.arg("-f").arg("rawvideo");
        cmd.arg("-pix_fmt").arg("rgb24");
        cmd.arg("pipe:1");
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| err!(Unavailable, msg("unable to spawn ffmpeg for frame tap"), source(e)))?;
        let Some(mut stdout) = child.stdout.take() else {
            bail!(Internal, msg("ffmpeg child has no stdout"));
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel::<Frame>(4);
        let clocks = self.db.clocks();
        let reader_stop = stop.clone();
        let stream_name = stream.to_owned();
        std::thread::Builder::new()
            .name(format!("tap-{stream}"))
            .spawn(move || {
                use std::io::Read;
                let frame_len = (TAP_WIDTH * TAP_HEIGHT * 3) as usize;
                let mut buf = vec![0u8; frame_len];
                while !reader_stop.load(Ordering::SeqCst) {
                    if let Err(e) = stdout.read_exact(&mut buf) {
                        if !reader_stop.load(Ordering::SeqCst) {
                            debug!(stream = %stream_name, "frame tap ended: {e}");
                        }
                        break;
                    }
                    let frame = Frame {
                        data: buf.clone(),
                        width: TAP_WIDTH,
                        height: TAP_HEIGHT,
                        ts: clocks.realtime(),
                    };
                    // Drop frames rather than stall the decoder when the
                    // worker falls behind.
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::TrySendError::Full(_)) => {}
                        Err(mpsc::TrySendError::Disconnected(_)) => break,
                    }
                }
            })
            .map_err(|e| err!(Internal, msg("unable to spawn tap reader"), source(e)))?;

        self.streams
            .lock()
            .entry(stream.to_owned())
            .or_default()
            .tap = Some(TapProc { child, stop });
        Ok(rx)
    }

    fn stop_frame_tap(&self, stream: &str) {
        let tap = self
            .streams
            .lock()
            .get_mut(stream)
            .and_then(|p| p.tap.take());
        if let Some(tap) = tap {
            tap.stop.store(true, Ordering::SeqCst);
            stop_child(tap.child, "frame tap");
        }
    }
}

fn finalize<C: Clocks + Clone>(db: &Database<C>, r: RecordProc) {
    let size = std::fs::metadata(&r.path).map(|m| m.len() as i64).unwrap_or(0);
    if let Err(e) = db.lock().finalize_recording(r.recording_id, size) {
        error!(err = %e.chain(), "unable to finalize recording {}", r.recording_id);
    }
}
