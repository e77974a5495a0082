// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recorder's input side: an RTSP URL in, video access units out.
//!
//! The transport layer is delegated to an external demuxer (ffmpeg) run as
//! a child process with an argv array; its single-video-stream MPEG-TS
//! output on stdout is demultiplexed in-process by [`crate::mpegts`]. The
//! [`Opener`]/[`Stream`] traits exist for test injection.

use crate::mpegts::{Demuxer, VideoPacket, TS_PACKET_SIZE};
use base::{bail, Error, ErrorKind, ResultExt as _};
use bytes::Bytes;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Opens an RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL, blocking through transport negotiation.
    fn open(&self, url: &str) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    /// The stream-level packets a segment file must start with to be
    /// playable on its own. Valid once the first access unit has been
    /// returned.
    fn init_data(&self) -> Bytes;

    /// The next video access unit, or `None` at end of stream.
    fn next(&mut self) -> Result<Option<VideoPacket>, Error>;
}

/// Arguments for the external demuxer: RTSP over TCP with a 5-second I/O
/// timeout, the first video stream copied without re-encoding into a
/// transport stream on stdout, audio dropped.
pub fn input_args(url: &str) -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-loglevel",
        "error",
        "-rtsp_transport",
        "tcp",
        "-stimeout",
        "5000000",
        "-i",
        url,
        "-c:v",
        "copy",
        "-an",
        "-f",
        "mpegts",
        "pipe:1",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

pub struct FfmpegOpener {
    pub ffmpeg_bin: String,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        FfmpegOpener {
            ffmpeg_bin: "ffmpeg".to_owned(),
        }
    }
}

impl Opener for FfmpegOpener {
    fn open(&self, url: &str) -> Result<Box<dyn Stream>, Error> {
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(input_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .err_kind(ErrorKind::Unavailable)?;
        let stdout = child
            .stdout
            .take()
            .expect("ffmpeg child was spawned with piped stdout");
        debug!(url, pid = child.id(), "opened input demuxer");
        Ok(Box::new(FfmpegStream::new(child, stdout)))
    }
}

struct FfmpegStream {
    child: Child,
    reader: std::io::BufReader<std::process::ChildStdout>,
    demux: Demuxer,
    eof: bool,
}

impl FfmpegStream {
    fn new(child: Child, stdout: std::process::ChildStdout) -> Self {
        FfmpegStream {
            child,
            reader: std::io::BufReader::with_capacity(64 * TS_PACKET_SIZE, stdout),
            demux: Demuxer::new(),
            eof: false,
        }
    }
}

impl Stream for FfmpegStream {
    fn init_data(&self) -> Bytes {
        self.demux.psi()
    }

    fn next(&mut self) -> Result<Option<VideoPacket>, Error> {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        while !self.eof {
            match self.reader.read_exact(&mut pkt) {
                Ok(()) => {
                    if let Some(au) = self.demux.push(&pkt)? {
                        return Ok(Some(au));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    if !self.demux.has_program() {
                        bail!(
                            FailedPrecondition,
                            msg("no video stream found before end of input")
                        );
                    }
                }
                Err(e) => return Err(Error::wrap(ErrorKind::Unavailable, e)),
            }
        }
        Ok(self.demux.flush())
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!(%status, "input demuxer exited"),
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!(err = %e, "unable to kill input demuxer");
                }
                let _ = self.child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_args_shape() {
        let args = input_args("rtsp://cam/main");
        assert_eq!(args.last().unwrap(), "pipe:1");
        let tcp = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[tcp + 1], "tcp");
        let timeout = args.iter().position(|a| a == "-stimeout").unwrap();
        assert_eq!(args[timeout + 1], "5000000");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "rtsp://cam/main");
        assert!(args.iter().any(|a| a == "-an"));
        assert!(
            !args.iter().any(|a| a.contains(' ')),
            "argv must stay unsplit"
        );
    }

    /// `cat` of a synthesized transport stream stands in for the external
    /// demuxer, exercising the child-process plumbing without a camera.
    #[test]
    fn reads_stream_from_child_process() {
        use crate::mpegts::testutil::*;
        let dir = tempfile::tempdir().unwrap();
        let ts_path = dir.path().join("input.ts");
        let mut data = Vec::new();
        data.extend_from_slice(&pat_packet());
        data.extend_from_slice(&pmt_packet(0x1b));
        data.extend_from_slice(&pes_start_packet(0, true));
        data.extend_from_slice(&pes_cont_packet());
        data.extend_from_slice(&pes_start_packet(3_600, false));
        std::fs::write(&ts_path, &data).unwrap();

        let mut child = Command::new("cat")
            .arg(&ts_path)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut stream = FfmpegStream::new(child, stdout);

        let first = stream.next().unwrap().unwrap();
        assert!(first.is_key);
        assert_eq!(first.pts_90k, Some(0));
        assert_eq!(stream.init_data().len(), 2 * TS_PACKET_SIZE);
        let second = stream.next().unwrap().unwrap();
        assert!(!second.is_key);
        assert!(stream.next().unwrap().is_none());
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn missing_video_stream_is_fatal() {
        let mut child = Command::new("true").stdout(Stdio::piped()).spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut stream = FfmpegStream::new(child, stdout);
        let e = stream.next().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
    }
}
