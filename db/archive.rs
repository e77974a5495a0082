// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The archive: one camera's on-disk layout.
//!
//! ```text
//! <root>/segments/NNNNNN.ts   MPEG-TS segments, keyframe-aligned
//! <root>/index.db             timeline index (see `index`)
//! <root>/ai.db                companion event log (see `events`)
//! ```

use crate::events::EventLog;
use crate::index::Index;
use base::{Error, ErrorKind, ResultExt as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

pub const SEGMENTS_DIR: &str = "segments";

/// Everything the recorder and resolver need to know about one camera's
/// archive, as a single owned value: the root path, the writable index and
/// event log, and the segment filename counter.
pub struct Archive {
    root: PathBuf,
    pub index: Index,
    pub events: EventLog,
    next_segment: AtomicU32,
}

impl Archive {
    /// Opens an archive rooted at `root`, creating the directory layout if
    /// needed.
    ///
    /// The segment counter resumes one past the highest `NNNNNN.ts` already
    /// present, so a restarted recorder never overwrites an earlier run's
    /// segments.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, Error> {
        let root = root.into();
        let segments = root.join(SEGMENTS_DIR);
        std::fs::create_dir_all(&segments).err_kind(ErrorKind::Internal)?;
        let next = match highest_segment_number(&segments)? {
            Some(n) => n + 1,
            None => 0,
        };
        if next != 0 {
            info!(root = %root.display(), next, "resuming segment numbering");
        }
        let index = Index::open(root.join("index.db"));
        let events = EventLog::open(root.join("ai.db"));
        Ok(Archive {
            root,
            index,
            events,
            next_segment: AtomicU32::new(next),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a segment file named in the index.
    pub fn segment_path(&self, file: &str) -> PathBuf {
        self.root.join(SEGMENTS_DIR).join(file)
    }

    /// Reserves the next segment basename and returns it with its full path,
    /// ensuring the segments directory exists. No two calls within a process
    /// return the same path.
    pub fn next_segment_path(&self) -> Result<(String, PathBuf), Error> {
        let dir = self.root.join(SEGMENTS_DIR);
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).err_kind(ErrorKind::Internal)?;
        }
        let n = self.next_segment.fetch_add(1, Ordering::SeqCst);
        let file = format!("{n:06}.ts");
        let path = dir.join(&file);
        Ok((file, path))
    }
}

/// Highest `NNNNNN.ts` number present in `dir`, if any.
fn highest_segment_number(dir: &Path) -> Result<Option<u32>, Error> {
    let mut max = None;
    for entry in std::fs::read_dir(dir).err_kind(ErrorKind::Internal)? {
        let entry = entry.err_kind(ErrorKind::Internal)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".ts") else {
            continue;
        };
        if let Ok(n) = stem.parse::<u32>() {
            max = std::cmp::max(max, Some(n));
        }
    }
    Ok(max)
}
