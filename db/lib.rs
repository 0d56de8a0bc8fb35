// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

#![cfg_attr(all(feature = "nightly", test), feature(test))]

pub mod db;
pub mod json;
mod raw;
pub mod testutil;
pub mod upgrade;

pub use crate::db::{
    Database, DatabaseGuard, Detection, LockedDatabase, Recording, RecordingToInsert,
    RetentionPolicy, RetentionTier, StorageSummary, TriggerType, Zone,
};
