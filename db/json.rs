// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types for use in the database schema. See references from `schema.sql`.

use rusqlite::types::{FromSqlError, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

macro_rules! sql {
    ($l:ident) => {
        impl rusqlite::types::FromSql for $l {
            fn column_result(value: ValueRef) -> Result<Self, FromSqlError> {
                match value {
                    ValueRef::Text(t) => {
                        Ok(serde_json::from_slice(t)
                            .map_err(|e| FromSqlError::Other(Box::new(e)))?)
                    }
                    _ => Err(FromSqlError::InvalidType),
                }
            }
        }

        impl rusqlite::types::ToSql for $l {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(serde_json::to_string(&self)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?
                    .into())
            }
        }
    };
}

/// Which detections to keep, based on their label.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectFilterKind {
    /// Keep every detection.
    #[default]
    None,

    /// Keep only detections whose label is in the filter list.
    Include,

    /// Keep only detections whose label is *not* in the filter list.
    Exclude,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GlobalConfig {
    /// The base retention period for streams which don't set their own,
    /// in days. 0 disables time-based retention for such streams.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Total storage budget in bytes; 0 means unlimited. Advisory: the
    /// pressure engine works from actual free space, not this number.
    #[serde(default)]
    pub max_size_bytes: i64,

    /// Prefix for the topics published on the event bus, for an external
    /// MQTT bridge to relay. The core itself does not speak MQTT.
    #[serde(default)]
    pub mqtt_topic_prefix: String,

    /// Directory holding detection model files.
    #[serde(default)]
    pub models_path: String,

    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}
sql!(GlobalConfig);

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamConfig {
    /// The `rtsp://` (or other) URL to use for this stream, including any
    /// credentials.
    #[serde(default)]
    pub source_url: Option<Url>,

    /// Whether the supervisor should run this stream at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to serve this stream over HLS.
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,

    /// Whether to record continuously (possibly gated by
    /// `record_on_schedule`).
    #[serde(default)]
    pub record: bool,

    /// When true, `record` is additionally gated by `recording_schedule`.
    #[serde(default)]
    pub record_on_schedule: bool,

    /// 168 characters of `0`/`1`, one per hour of the week starting Sunday
    /// 00:00 local time. Empty means always allowed.
    #[serde(default)]
    pub recording_schedule: String,

    /// Whether detections start and stop recordings on this stream.
    /// When `record` is also set, detection runs in annotation-only mode.
    #[serde(default)]
    pub detection_based_recording: bool,

    /// Opaque identifier of the detection model to use; empty means none.
    #[serde(default)]
    pub detection_model: String,

    /// Minimum confidence for a detection to trigger recording, in [0, 1].
    /// A hard floor of 0.5 applies regardless of this value.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,

    /// Process one frame out of this many; minimum 1.
    #[serde(default = "default_detection_interval")]
    pub detection_interval: u32,

    /// Seconds of video to keep from before the first triggering detection.
    #[serde(default = "default_pre_detection_buffer_s")]
    pub pre_detection_buffer_s: u32,

    /// Seconds of video to keep after the last triggering detection.
    #[serde(default = "default_post_detection_buffer_s")]
    pub post_detection_buffer_s: u32,

    /// Retention period in days; 0 inherits the global setting.
    #[serde(default)]
    pub retention_days: u32,

    /// Retention period for detection-triggered recordings in days;
    /// 0 means three times the effective regular period.
    #[serde(default)]
    pub detection_retention_days: u32,

    /// Per-stream storage quota in mebibytes; 0 means unlimited.
    #[serde(default)]
    pub max_storage_mb: u64,

    /// Multipliers applied to the base retention period, per retention tier.
    #[serde(default = "default_tier_critical_multiplier")]
    pub tier_critical_multiplier: f64,
    #[serde(default = "default_tier_important_multiplier")]
    pub tier_important_multiplier: f64,
    #[serde(default = "default_tier_standard_multiplier")]
    pub tier_standard_multiplier: f64,
    #[serde(default = "default_tier_ephemeral_multiplier")]
    pub tier_ephemeral_multiplier: f64,

    #[serde(default)]
    pub detection_object_filter: ObjectFilterKind,

    /// Comma-separated labels for `detection_object_filter`.
    #[serde(default)]
    pub detection_object_filter_list: String,

    /// Relative importance of this stream; advisory.
    #[serde(default)]
    pub priority: i32,

    /// Whether the camera speaks ONVIF (affects how the pipeline probes it).
    #[serde(default)]
    pub is_onvif: bool,

    /// Advisory codec hint for the pipeline, e.g. `h264`.
    #[serde(default)]
    pub codec_hint: String,

    /// Advisory frame rate hint for the pipeline; 0 means unknown.
    #[serde(default)]
    pub frame_rate_hint: f32,

    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}
sql!(StreamConfig);

impl Default for StreamConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all StreamConfig fields have defaults")
    }
}

fn default_true() -> bool {
    true
}
fn default_retention_days() -> u32 {
    30
}
fn default_detection_threshold() -> f32 {
    0.5
}
fn default_detection_interval() -> u32 {
    10
}
fn default_pre_detection_buffer_s() -> u32 {
    5
}
fn default_post_detection_buffer_s() -> u32 {
    10
}
fn default_tier_critical_multiplier() -> f64 {
    100.0
}
fn default_tier_important_multiplier() -> f64 {
    2.0
}
fn default_tier_standard_multiplier() -> f64 {
    1.0
}
fn default_tier_ephemeral_multiplier() -> f64 {
    0.5
}
