// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The playback resolver: a wall-clock interval in, a continuous stream out.
//!
//! Resolution queries the timeline index read-only, writes a concat
//! playlist of the surviving segment files, and drives the external muxer
//! as a child process: stream-copy at speed 1.0, a `setpts` re-encode
//! otherwise, audio always disabled. Cancellation propagates as SIGTERM to
//! the child; the playlist never outlives the resolver.

use base::{bail, Error, ErrorKind, ResultExt as _};
use db::index::{Index, Time};
use db::archive::SEGMENTS_DIR;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// Where the muxed transport stream goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
    /// `pipe:1`, for a relay consuming our stdout.
    Stdout,
    /// An RTSP publish URL, carried over TCP.
    Rtsp(String),
    /// A regular file.
    File(PathBuf),
}

impl Sink {
    /// Parses the CLI form: `pipe:1`/`-` for stdout, `rtsp://...`, or a
    /// file path.
    pub fn parse(s: &str) -> Sink {
        match s {
            "pipe:1" | "-" => Sink::Stdout,
            _ if s.starts_with("rtsp://") => Sink::Rtsp(s.to_owned()),
            _ => Sink::File(PathBuf::from(s)),
        }
    }
}

pub struct Request {
    pub archive_dir: PathBuf,
    pub from: Time,
    pub to: Time,
    pub speed: f64,
    pub sink: Sink,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The mux child ran; its exit status is propagated.
    Completed { child_ok: bool },
    /// Nothing overlaps the requested range (or every overlapping file is
    /// gone). `total_segments` is the index's row count, for diagnostics.
    NoData { total_segments: i64 },
}

/// Deletes the playlist when resolution ends, however it ends.
struct PlaylistGuard {
    path: PathBuf,
}

impl Drop for PlaylistGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), err = %e, "unable to remove playlist");
            }
        }
    }
}

/// Writes the concat playlist, one `file '...'` line per segment that still
/// exists on disk, in index order. Returns the number of lines written.
fn write_playlist(
    path: &Path,
    archive_dir: &Path,
    segments: &[db::SegmentRow],
) -> Result<usize, Error> {
    let f = std::fs::File::create(path).err_kind(ErrorKind::Internal)?;
    let mut w = std::io::BufWriter::new(f);
    let mut lines = 0;
    for s in segments {
        let seg_path = archive_dir.join(SEGMENTS_DIR).join(&s.file);
        if !seg_path.is_file() {
            warn!(file = s.file, "segment file missing; skipping");
            continue;
        }
        writeln!(&mut w, "file '{}'", seg_path.display()).err_kind(ErrorKind::Internal)?;
        lines += 1;
    }
    w.flush().err_kind(ErrorKind::Internal)?;
    Ok(lines)
}

/// The external muxer's argv: concat demuxer over the playlist with unsafe
/// paths allowed and missing PTS regenerated; stream copy at unit speed or
/// a `PTS/speed` division (which forces a re-encode) otherwise; no audio;
/// MPEG-TS out.
pub fn mux_args(playlist: &Path, speed: f64, sink: &Sink) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-nostdin",
        "-loglevel",
        "error",
        "-re",
        "-fflags",
        "+genpts",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(playlist.into());
    if speed == 1.0 {
        args.extend(["-c:v", "copy"].map(OsString::from));
    } else {
        args.push("-vf".into());
        args.push(format!("setpts=PTS/{speed}").into());
        args.extend(["-c:v", "libx264", "-preset", "ultrafast"].map(OsString::from));
    }
    args.push("-an".into());
    match sink {
        Sink::Stdout => args.extend(["-f", "mpegts", "pipe:1"].map(OsString::from)),
        Sink::Rtsp(url) => {
            args.extend(["-rtsp_transport", "tcp", "-f", "rtsp"].map(OsString::from));
            args.push(url.into());
        }
        Sink::File(path) => {
            args.extend(["-y", "-f", "mpegts"].map(OsString::from));
            args.push(path.into());
        }
    }
    args
}

/// Resolves the request and, if any data exists, blocks on the mux child
/// until it exits or a termination signal arrives.
pub fn resolve_and_stream(req: &Request, ffmpeg_bin: &str) -> Result<Outcome, Error> {
    if req.speed <= 0.0 {
        bail!(InvalidArgument, msg("speed must be positive, not {}", req.speed));
    }
    let index = Index::open_read_only(req.archive_dir.join("index.db"))?;
    let segments = index.segments_overlapping(req.from, req.to)?;
    if segments.is_empty() {
        let total_segments = index.total_segments().unwrap_or(0);
        info!(
            from = req.from.0,
            to = req.to.0,
            total_segments,
            "no segments in range"
        );
        return Ok(Outcome::NoData { total_segments });
    }
    info!(count = segments.len(), "resolved segments");

    let playlist = std::env::temp_dir().join(format!("playback_concat_{}.txt", std::process::id()));
    let guard = PlaylistGuard {
        path: playlist.clone(),
    };
    let lines = write_playlist(&playlist, &req.archive_dir, &segments)?;
    if lines == 0 {
        let total_segments = index.total_segments().unwrap_or(0);
        warn!("every overlapping segment file is missing");
        return Ok(Outcome::NoData { total_segments });
    }

    let mut child = Command::new(ffmpeg_bin)
        .args(mux_args(&playlist, req.speed, &req.sink))
        .stdin(Stdio::null())
        .spawn()
        .err_kind(ErrorKind::Unavailable)?;
    info!(pid = child.id(), speed = req.speed, "started mux child");

    let mut signaled = false;
    let status = loop {
        if base::shutdown::signals::requested() && !signaled {
            info!("stopping mux child");
            let pid = nix::unistd::Pid::from_raw(child.id() as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!(err = %e, "unable to signal mux child");
            }
            signaled = true;
        }
        match child.try_wait().err_kind(ErrorKind::Internal)? {
            Some(status) => break status,
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    };
    drop(guard);
    info!(%status, "mux child exited");
    Ok(Outcome::Completed {
        child_ok: status.success(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::testutil::TestArchive;

    fn record_segments(ta: &mut TestArchive, spans: &[(i64, i64)]) {
        for (start, end) in spans {
            let (file, path) = ta.archive.next_segment_path().unwrap();
            std::fs::write(path, b"ts").unwrap();
            ta.archive
                .index
                .insert_segment(&file, None, Time(*start))
                .unwrap();
            ta.archive.index.close_segment(None, Time(*end));
        }
    }

    #[test]
    fn playlist_skips_missing_files() {
        db::testutil::init();
        let mut ta = TestArchive::new();
        record_segments(&mut ta, &[(0, 2_000), (2_000, 4_000)]);
        std::fs::remove_file(ta.archive.segment_path("000001.ts")).unwrap();

        let segments = ta
            .archive
            .index
            .segments_overlapping(Time(0), Time(10_000))
            .unwrap();
        assert_eq!(segments.len(), 2);
        let playlist = ta.tmpdir.path().join("playlist.txt");
        let lines = write_playlist(&playlist, ta.tmpdir.path(), &segments).unwrap();
        assert_eq!(lines, 1);
        let contents = std::fs::read_to_string(&playlist).unwrap();
        assert!(contents.contains("000000.ts"), "{contents}");
        assert!(!contents.contains("000001.ts"), "{contents}");
    }

    #[test]
    fn copy_args_at_unit_speed() {
        let args = mux_args(Path::new("/tmp/p.txt"), 1.0, &Sink::Stdout);
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        let codec = args.iter().position(|a| *a == "-c:v").unwrap();
        assert_eq!(args[codec + 1], "copy");
        assert!(!args.iter().any(|a| a.starts_with("setpts")));
        assert!(args.contains(&"-an"));
        assert!(args.contains(&"+genpts"));
        assert_eq!(*args.last().unwrap(), "pipe:1");
        let concat = args.iter().position(|a| *a == "-f").unwrap();
        assert_eq!(args[concat + 1], "concat");
    }

    #[test]
    fn reencode_args_at_double_speed() {
        let args = mux_args(Path::new("/tmp/p.txt"), 2.0, &Sink::Stdout);
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        let vf = args.iter().position(|a| *a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "setpts=PTS/2");
        let codec = args.iter().position(|a| *a == "-c:v").unwrap();
        assert_eq!(args[codec + 1], "libx264");
    }

    #[test]
    fn rtsp_sink_goes_over_tcp() {
        let args = mux_args(
            Path::new("/tmp/p.txt"),
            1.0,
            &Sink::Rtsp("rtsp://127.0.0.1:8555/cam_playback".to_owned()),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        let t = args.iter().position(|a| *a == "-rtsp_transport").unwrap();
        assert_eq!(args[t + 1], "tcp");
        assert_eq!(*args.last().unwrap(), "rtsp://127.0.0.1:8555/cam_playback");
    }

    #[test]
    fn sink_parsing() {
        assert_eq!(Sink::parse("pipe:1"), Sink::Stdout);
        assert_eq!(Sink::parse("-"), Sink::Stdout);
        assert_eq!(
            Sink::parse("rtsp://host/path"),
            Sink::Rtsp("rtsp://host/path".to_owned())
        );
        assert_eq!(Sink::parse("/tmp/out.ts"), Sink::File("/tmp/out.ts".into()));
    }

    #[test]
    fn empty_range_reports_total_count() {
        db::testutil::init();
        let mut ta = TestArchive::new();
        record_segments(&mut ta, &[(1_000, 3_000)]);
        let req = Request {
            archive_dir: ta.tmpdir.path().to_owned(),
            from: Time(10_000),
            to: Time(20_000),
            speed: 1.0,
            sink: Sink::Stdout,
        };
        match resolve_and_stream(&req, "true").unwrap() {
            Outcome::NoData { total_segments } => assert_eq!(total_segments, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn inverted_range_is_empty_not_an_error() {
        db::testutil::init();
        let mut ta = TestArchive::new();
        record_segments(&mut ta, &[(1_000, 3_000)]);
        let req = Request {
            archive_dir: ta.tmpdir.path().to_owned(),
            from: Time(3_000),
            to: Time(1_000),
            speed: 1.0,
            sink: Sink::Stdout,
        };
        assert!(matches!(
            resolve_and_stream(&req, "true").unwrap(),
            Outcome::NoData { .. }
        ));
    }

    /// With `true` standing in for the muxer, the child path runs end to
    /// end and the playlist is cleaned up.
    #[test]
    fn child_runs_and_playlist_is_removed() {
        db::testutil::init();
        base::shutdown::signals::reset();
        let mut ta = TestArchive::new();
        record_segments(&mut ta, &[(1_000, 3_000)]);
        let req = Request {
            archive_dir: ta.tmpdir.path().to_owned(),
            from: Time(0),
            to: Time(5_000),
            speed: 1.0,
            sink: Sink::Stdout,
        };
        let outcome = resolve_and_stream(&req, "true").unwrap();
        assert_eq!(outcome, Outcome::Completed { child_ok: true });
        let playlist =
            std::env::temp_dir().join(format!("playback_concat_{}.txt", std::process::id()));
        assert!(!playlist.exists());
    }

    #[test]
    fn zero_speed_is_a_usage_error() {
        db::testutil::init();
        let ta = TestArchive::new();
        let req = Request {
            archive_dir: ta.tmpdir.path().to_owned(),
            from: Time(0),
            to: Time(1),
            speed: 0.0,
            sink: Sink::Stdout,
        };
        let e = resolve_and_stream(&req, "true").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }
}
