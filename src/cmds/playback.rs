// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand: replay an archived time range as one continuous stream.

use crate::playback::{self, Outcome, Request, Sink};
use base::Error;
use bpaf::Bpaf;
use db::Time;
use std::path::PathBuf;
use tracing::error;

/// Resolves `[from_ms, to_ms]` against the archive's timeline index and
/// streams the concatenation, optionally accelerated. Exits 1 when the
/// range holds no segments.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// External muxer binary.
    #[bpaf(long, argument("BIN"), fallback("ffmpeg".into()))]
    ffmpeg: String,

    /// Archive root directory.
    #[bpaf(positional("ARCHIVE"))]
    archive: PathBuf,

    /// Range start, milliseconds since the Unix epoch.
    #[bpaf(positional("FROM_MS"))]
    from_ms: i64,

    /// Range end, milliseconds since the Unix epoch.
    #[bpaf(positional("TO_MS"))]
    to_ms: i64,

    /// Playback speed; anything but 1.0 re-encodes.
    #[bpaf(positional("SPEED"))]
    speed: f64,

    /// `pipe:1` (default), an `rtsp://` publish URL, or a file path.
    #[bpaf(positional("SINK"), fallback("pipe:1".into()))]
    sink: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::shutdown::signals::install();
    let req = Request {
        archive_dir: args.archive,
        from: Time(args.from_ms),
        to: Time(args.to_ms),
        speed: args.speed,
        sink: Sink::parse(&args.sink),
    };
    match playback::resolve_and_stream(&req, &args.ffmpeg)? {
        Outcome::Completed { child_ok: true } => Ok(0),
        Outcome::Completed { child_ok: false } => Ok(1),
        Outcome::NoData { total_segments } => {
            error!(total_segments, "no segments in requested range");
            Ok(1)
        }
    }
}
