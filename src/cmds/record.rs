// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand: record one RTSP camera into a rolling archive.

use crate::recorder::{self, Environment, Recorder};
use crate::segment::{FileSinkOpener, PooledSinkOpener, SinkOpener};
use crate::stream::FfmpegOpener;
use crate::writer::WriterPool;
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::Archive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Records a single RTSP stream into `<base_path>` until end of stream or a
/// fatal error. With `--camera-id`, runs in per-camera tool form: takes a
/// PID lockfile and emits NDJSON events on stdout.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// Camera identifier; enables the instance lockfile and NDJSON events.
    #[bpaf(long, argument("ID"))]
    camera_id: Option<String>,

    /// Segment duration in seconds.
    #[bpaf(long, argument("SECS"), fallback(2))]
    segment: u64,

    /// Buffer whole segments in memory and persist through the writer pool.
    #[bpaf(long)]
    buffered_writes: bool,

    /// Path of the freshness counter consumed by the supervisor.
    #[bpaf(
        long,
        argument("PATH"),
        fallback(PathBuf::from(recorder::DEFAULT_HEARTBEAT_FILE))
    )]
    heartbeat_file: PathBuf,

    /// External demuxer binary.
    #[bpaf(long, argument("BIN"), fallback("ffmpeg".into()))]
    ffmpeg: String,

    /// RTSP URL of the camera.
    #[bpaf(positional("RTSP_URL"))]
    rtsp_url: String,

    /// Archive root directory.
    #[bpaf(positional("BASE_PATH"))]
    base_path: PathBuf,
}

fn emit(event: serde_json::Value) {
    println!("{event}");
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::shutdown::signals::install();

    let _lock = match &args.camera_id {
        Some(id) => {
            let path = std::env::temp_dir().join(format!("recorder_{id}.lock"));
            match super::InstanceLock::acquire(&path) {
                Ok(lock) => Some(lock),
                Err(_) => {
                    emit(serde_json::json!({"event": "error", "message": "Already running"}));
                    return Ok(1);
                }
            }
        }
        None => None,
    };

    let mut archive = Archive::open(&args.base_path)?;
    if let Some(id) = &args.camera_id {
        emit(serde_json::json!({
            "event": "recorder_starting",
            "camera": id,
            "path": args.base_path.display().to_string(),
        }));
    }

    let clocks = RealClocks {};
    let opener = FfmpegOpener {
        ffmpeg_bin: args.ffmpeg.clone(),
    };
    let pool; // outlives the recorder so queued segments drain on exit
    let sinks: Box<dyn SinkOpener> = if args.buffered_writes {
        pool = Arc::new(WriterPool::new(2, 64));
        Box::new(PooledSinkOpener { pool: pool.clone() })
    } else {
        Box::new(FileSinkOpener)
    };

    let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut r = Recorder::new(
        Environment {
            clocks: &clocks,
            opener: &opener,
            sinks: sinks.as_ref(),
        },
        &mut archive,
        args.rtsp_url.clone(),
    )
    .with_segment_duration(Duration::from_secs(args.segment.max(1)))
    .with_heartbeat_file(args.heartbeat_file.clone());
    if let Some(id) = args.camera_id.clone() {
        r = r.with_segment_closed_hook(Box::new(move |file, ts| {
            emit(serde_json::json!({
                "event": "segment_written",
                "camera": id,
                "file": file,
                "ts": ts.0 / 1000,
            }));
        }));
    }
    r.run(&shutdown_rx)?;
    Ok(0)
}
