// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recorder pipeline: demux an RTSP stream, rotate keyframe-aligned
//! segment files, keep the timeline index current.

use crate::mpegts::VideoPacket;
use crate::segment::{SegmentSink, SinkOpener};
use crate::stream;
use base::clock::{Clocks, TimerGuard};
use base::Error;
use db::{Archive, Time};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Nominal segment length. Segments may exceed this when keyframes are
/// sparse (a camera configured with a long GOP); a segment must begin with
/// a keyframe so playback can decode without prior state.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(2);

/// The freshness counter is rewritten every this many video packets.
pub const HEARTBEAT_INTERVAL_PACKETS: u64 = 100;

pub const DEFAULT_HEARTBEAT_FILE: &str = "/tmp/dss-recorder.hb";

/// Common state shared by the recorder and its caller.
pub struct Environment<'a, C: Clocks> {
    pub clocks: &'a C,
    pub opener: &'a dyn stream::Opener,
    pub sinks: &'a dyn SinkOpener,
}

/// Called when a segment file has been completed, with its basename and the
/// wall-clock close time. Hook for the per-camera NDJSON event output.
pub type SegmentClosedHook = Box<dyn Fn(&str, Time) + Send>;

struct OpenSegment {
    sink: Box<dyn SegmentSink>,
    file: String,
    opened: Duration,
}

/// Connects to an RTSP stream and writes rotating segments plus index rows
/// until end of stream, shutdown, or a fatal error. One recorder per
/// camera per process; restart policy belongs to the supervisor.
pub struct Recorder<'a, C: Clocks> {
    env: Environment<'a, C>,
    archive: &'a mut Archive,
    url: String,
    segment_duration: Duration,
    heartbeat_file: PathBuf,
    on_segment_closed: Option<SegmentClosedHook>,
    packets_seen: u64,
}

impl<'a, C: Clocks> Recorder<'a, C> {
    pub fn new(env: Environment<'a, C>, archive: &'a mut Archive, url: String) -> Self {
        Recorder {
            env,
            archive,
            url,
            segment_duration: SEGMENT_DURATION,
            heartbeat_file: PathBuf::from(DEFAULT_HEARTBEAT_FILE),
            on_segment_closed: None,
            packets_seen: 0,
        }
    }

    pub fn with_segment_duration(mut self, d: Duration) -> Self {
        self.segment_duration = d;
        self
    }

    pub fn with_heartbeat_file(mut self, path: PathBuf) -> Self {
        self.heartbeat_file = path;
        self
    }

    pub fn with_segment_closed_hook(mut self, hook: SegmentClosedHook) -> Self {
        self.on_segment_closed = Some(hook);
        self
    }

    /// Runs until end of stream or shutdown. Errors returned from here are
    /// fatal to the recorder process: failure to open the input, a missing
    /// video stream, or failure to open a segment file. Per-packet write
    /// errors only abandon the current segment.
    pub fn run(&mut self, shutdown: &base::shutdown::Receiver) -> Result<(), Error> {
        let clocks = self.env.clocks;
        info!(url = %self.url, "opening input");
        let mut stream = {
            let _t = TimerGuard::new(clocks, || format!("opening {}", self.url));
            self.env.opener.open(&self.url)?
        };
        info!(
            segment_duration = ?self.segment_duration,
            "streaming; rotating on keyframes"
        );

        let mut current: Option<OpenSegment> = None;
        let mut last_pts = None;
        loop {
            if shutdown.check().is_err() || base::shutdown::signals::requested() {
                info!("shutdown requested");
                break;
            }
            let pkt = {
                let _t = TimerGuard::new(clocks, || "getting next packet");
                match stream.next()? {
                    Some(pkt) => pkt,
                    None => break,
                }
            };
            self.packets_seen += 1;
            if self.packets_seen % HEARTBEAT_INTERVAL_PACKETS == 0 {
                self.write_heartbeat();
            }
            last_pts = pkt.pts_90k.or(last_pts);

            let rotate = pkt.is_key
                && match &current {
                    None => true,
                    Some(c) => clocks.monotonic().saturating_sub(c.opened) >= self.segment_duration,
                };
            if rotate {
                self.close_segment(&mut current, pkt.pts_90k);
                current = Some(self.open_segment(&pkt, stream.init_data().as_ref())?);
            }

            let mut write_failed = false;
            if let Some(c) = &mut current {
                if let Err(e) = c.sink.write(&pkt) {
                    // Likely disk pressure; the segment is abandoned and a
                    // fresh one is attempted on the next keyframe.
                    warn!(file = c.file, err = %e.chain(), "segment write failed");
                    write_failed = true;
                } else {
                    self.archive.index.insert_frame(
                        pkt.pts_90k,
                        pkt.is_key,
                        Time(clocks.realtime_ms()),
                    );
                }
            }
            if write_failed {
                self.close_segment(&mut current, pkt.pts_90k);
            }
        }
        self.close_segment(&mut current, last_pts);
        info!(packets = self.packets_seen, "input ended");
        Ok(())
    }

    fn open_segment(&mut self, seed: &VideoPacket, init_data: &[u8]) -> Result<OpenSegment, Error> {
        let clocks = self.env.clocks;
        let (file, path) = self.archive.next_segment_path()?;
        debug!(
            file,
            seed_pts = ?seed.pts_90k,
            seed_pts_ms = ?seed.pts_90k.map(crate::mpegts::pts_to_ms),
            "starting segment"
        );
        self.archive
            .index
            .insert_segment(&file, seed.pts_90k, Time(clocks.realtime_ms()));
        let sink = self.env.sinks.create(&path, init_data)?;
        Ok(OpenSegment {
            sink,
            file,
            opened: clocks.monotonic(),
        })
    }

    fn close_segment(&mut self, current: &mut Option<OpenSegment>, end_pts: Option<i64>) {
        let Some(mut c) = current.take() else { return };
        let now = Time(self.env.clocks.realtime_ms());
        if let Err(e) = c.sink.finish() {
            warn!(file = c.file, err = %e.chain(), "unable to finish segment");
        }
        self.archive.index.close_segment(end_pts, now);
        if let Some(hook) = &self.on_segment_closed {
            hook(&c.file, now);
        }
    }

    fn write_heartbeat(&self) {
        if let Err(e) = std::fs::write(&self.heartbeat_file, format!("{}", self.packets_seen)) {
            warn!(path = %self.heartbeat_file.display(), err = %e, "unable to write freshness counter");
        }
    }
}
