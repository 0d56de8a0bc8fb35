// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The weekly recording schedule gate.
//!
//! A schedule is 168 slots, one per hour of the week in local time, indexed
//! `weekday * 24 + hour` with Sunday as weekday 0. It's stored in stream
//! configuration as a string of `0`/`1` characters so it survives JSON and
//! TOML without surprises.

use base::{bail, Error};
use db::json::StreamConfig;

pub const SLOTS: usize = 7 * 24;

#[derive(Clone, PartialEq, Eq)]
pub struct WeeklySchedule([bool; SLOTS]);

impl WeeklySchedule {
    /// Parses the stored form. Empty means "always allowed"; anything else
    /// must be exactly 168 `0`/`1` characters.
    pub fn parse(s: &str) -> Result<Option<Self>, Error> {
        if s.is_empty() {
            return Ok(None);
        }
        if s.len() != SLOTS {
            bail!(
                InvalidArgument,
                msg("recording schedule must be {SLOTS} characters; got {}", s.len())
            );
        }
        let mut slots = [false; SLOTS];
        for (i, c) in s.chars().enumerate() {
            slots[i] = match c {
                '0' => false,
                '1' => true,
                c => bail!(
                    InvalidArgument,
                    msg("recording schedule has bad character {c:?} at slot {i}")
                ),
            };
        }
        Ok(Some(Self(slots)))
    }

    pub fn allows(&self, now: &jiff::Zoned) -> bool {
        let weekday = now.weekday().to_sunday_zero_offset() as usize;
        let hour = now.hour() as usize;
        self.0[weekday * 24 + hour]
    }
}

impl std::fmt::Debug for WeeklySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: String = self.0.iter().map(|&b| if b { '1' } else { '0' }).collect();
        f.debug_tuple("WeeklySchedule").field(&s).finish()
    }
}

/// The schedule gate: recording is allowed unless `record_on_schedule` is set
/// and the current local hour's slot is 0. An unparseable schedule denies
/// recording.
pub fn is_recording_scheduled(cfg: &StreamConfig, now: &jiff::Zoned) -> bool {
    if !cfg.record_on_schedule {
        return true;
    }
    match WeeklySchedule::parse(&cfg.recording_schedule) {
        Ok(None) => true,
        Ok(Some(s)) => s.allows(now),
        Err(e) => {
            tracing::error!(err = %e.chain(), "bad recording schedule; denying recording");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zoned(s: &str) -> jiff::Zoned {
        s.parse().unwrap()
    }

    /// A schedule allowing only Monday 00:00-07:59 local time.
    fn monday_mornings() -> String {
        let mut slots = vec!['0'; SLOTS];
        for hour in 0..8 {
            slots[24 + hour] = '1'; // Monday is weekday 1.
        }
        slots.into_iter().collect()
    }

    #[test]
    fn parse_validates() {
        assert!(WeeklySchedule::parse("").unwrap().is_none());
        WeeklySchedule::parse("10").unwrap_err();
        WeeklySchedule::parse(&"2".repeat(SLOTS)).unwrap_err();
        assert!(WeeklySchedule::parse(&"1".repeat(SLOTS)).unwrap().is_some());
    }

    #[test]
    fn monday_window_edges() {
        let s = WeeklySchedule::parse(&monday_mornings()).unwrap().unwrap();
        // 2026-03-02 is a Monday.
        assert!(s.allows(&zoned("2026-03-02T00:00:00-08:00[America/Los_Angeles]")));
        assert!(s.allows(&zoned("2026-03-02T07:59:59-08:00[America/Los_Angeles]")));
        assert!(!s.allows(&zoned("2026-03-02T08:00:00-08:00[America/Los_Angeles]")));
        // Sunday morning is outside the window.
        assert!(!s.allows(&zoned("2026-03-01T03:00:00-08:00[America/Los_Angeles]")));
    }

    #[test]
    fn gate_ignores_schedule_unless_enabled() {
        let mut cfg = StreamConfig::default();
        cfg.recording_schedule = "0".repeat(SLOTS);
        cfg.record_on_schedule = false;
        assert!(is_recording_scheduled(
            &cfg,
            &zoned("2026-03-02T12:00:00-08:00[America/Los_Angeles]")
        ));
    }

    #[test]
    fn all_zero_schedule_never_records() {
        let mut cfg = StreamConfig::default();
        cfg.record_on_schedule = true;
        cfg.recording_schedule = "0".repeat(SLOTS);
        for t in [
            "2026-03-01T00:00:00-08:00[America/Los_Angeles]",
            "2026-03-02T08:00:00-08:00[America/Los_Angeles]",
            "2026-03-07T23:00:00-08:00[America/Los_Angeles]",
        ] {
            assert!(!is_recording_scheduled(&cfg, &zoned(t)));
        }
    }

    #[test]
    fn empty_schedule_always_allows() {
        let mut cfg = StreamConfig::default();
        cfg.record_on_schedule = true;
        assert!(is_recording_scheduled(
            &cfg,
            &zoned("2026-03-02T12:00:00-08:00[America/Los_Angeles]")
        ));
    }

    #[test]
    fn bad_schedule_fails_closed() {
        let mut cfg = StreamConfig::default();
        cfg.record_on_schedule = true;
        cfg.recording_schedule = "junk".to_owned();
        assert!(!is_recording_scheduled(
            &cfg,
            &zoned("2026-03-02T12:00:00-08:00[America/Los_Angeles]")
        ));
    }
}
