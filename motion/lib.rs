// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Motion detection for the snapshot-polling consumer, exposed over a
//! C-compatible handle API (see [`ffi`]).

mod detector;
pub mod ffi;

pub use crate::detector::{Config, Detector, Rect, RoiCrop};
