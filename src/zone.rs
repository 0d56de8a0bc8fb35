// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection zone geometry and filtering.
//!
//! A zone is a polygon in normalized `[0,1]²` image coordinates. A detection
//! passes the zone filter iff its center falls inside some enabled zone whose
//! class list and minimum confidence it satisfies; the detection is tagged
//! with the first matching zone's id. With no zones defined (or none
//! enabled), everything passes untagged.

use db::Zone;

/// Even-odd ray casting: casts a ray in +x and counts crossings.
pub fn polygon_contains(points: &[[f64; 2]], x: f64, y: f64) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = points[i];
        let [xj, yj] = points[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether a detection with the given center/label/confidence satisfies one
/// zone's constraints.
fn zone_matches(z: &Zone, cx: f64, cy: f64, label: &str, confidence: f32) -> bool {
    if !z.enabled || confidence < z.min_confidence {
        return false;
    }
    if !z.classes.is_empty() && !z.classes.iter().any(|c| c == label) {
        return false;
    }
    polygon_contains(&z.points, cx, cy)
}

/// Applies the zone filter to one detection given by its bounding box.
/// Returns `None` to drop it, or `Some(zone_id)` (possibly `None` when no
/// zones are configured) to keep it.
pub fn evaluate(
    zones: &[Zone],
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    label: &str,
    confidence: f32,
) -> Option<Option<i64>> {
    if zones.iter().all(|z| !z.enabled) {
        // No zones defined or none enabled: keep all.
        return Some(None);
    }
    let (cx, cy) = (x + w / 2.0, y + h / 2.0);
    zones
        .iter()
        .find(|z| zone_matches(z, cx, cy, label, confidence))
        .map(|z| Some(z.id))
}
