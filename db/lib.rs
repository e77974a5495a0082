// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod archive;
pub mod events;
pub mod index;

// This is only for #[cfg(test)], but it's also used by the dependent crate,
// and #[cfg(test)] is not passed on to dependencies.
pub mod testutil;

pub use crate::archive::Archive;
pub use crate::events::EventLog;
pub use crate::index::{Index, SegmentId, SegmentRow, Time};
