// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving lightnvr's persistence library.
//! Used for tests of both the `lightnvr_db` crate itself and the `lightnvr`
//! crate.

use crate::db::{self, RecordingToInsert, RetentionTier, TriggerType};
use crate::json::StreamConfig;
use base::clock::Clocks;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Name of the stream created by [`TestDb::new`].
pub const TEST_STREAM: &str = "test";

/// Performs global initialization for tests.
///    * set up logging. (Note the output can be confusing unless
///      `RUST_TEST_THREADS=1` is set in the program's environment prior to
///      running.)
///    * set time zone `America/Los_Angeles` so that tests that care about
///      calendar time get the expected results regardless of machine setup.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        std::env::set_var("TZ", "America/Los_Angeles");
    });
}

pub struct TestDb<C: Clocks + Clone> {
    pub db: Arc<db::Database<C>>,
    pub tmpdir: TempDir,
}

impl<C: Clocks + Clone> TestDb<C> {
    /// Creates a test database with one stream and a storage directory
    /// skeleton (`mp4/`, `recordings/`, `hls/`, `thumbnails/`).
    pub fn new(clocks: C) -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("lightnvr-test")
            .tempdir()
            .unwrap();
        for d in ["mp4", "recordings", "hls", "thumbnails"] {
            std::fs::create_dir(tmpdir.path().join(d)).unwrap();
        }
        std::fs::create_dir(tmpdir.path().join("recordings").join(TEST_STREAM)).unwrap();

        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        let db = Arc::new(db::Database::new(clocks, conn).unwrap());
        db.lock()
            .upsert_stream(TEST_STREAM, StreamConfig::default())
            .unwrap();
        TestDb { db, tmpdir }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.tmpdir.path().to_owned()
    }

    /// Inserts a standard-tier continuous recording created at `when`,
    /// backed by a real file of `size_bytes` under `recordings/{stream}/`.
    pub fn insert_recording_at(
        &self,
        stream: &str,
        when: jiff::Timestamp,
        size_bytes: i64,
        protected: bool,
    ) -> i64 {
        self.insert_recording_with(
            stream,
            when,
            size_bytes,
            TriggerType::Continuous,
            RetentionTier::Standard,
            protected,
        )
    }

    pub fn insert_recording_with(
        &self,
        stream: &str,
        when: jiff::Timestamp,
        size_bytes: i64,
        trigger: TriggerType,
        tier: RetentionTier,
        protected: bool,
    ) -> i64 {
        let dir = self.tmpdir.path().join("recordings").join(stream);
        std::fs::create_dir_all(&dir).unwrap();
        // File names only need to be unique within the test.
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.join(format!(
            "{}_{}_{n}.mp4",
            trigger.as_str(),
            when.as_second()
        ));
        std::fs::write(&path, vec![0u8; usize::try_from(size_bytes).unwrap()]).unwrap();
        self.db
            .lock()
            .insert_recording(&RecordingToInsert {
                stream_name: stream.to_owned(),
                file_path: path,
                size_bytes,
                created_at: when,
                trigger,
                tier,
                protected,
            })
            .unwrap()
    }
}

static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
