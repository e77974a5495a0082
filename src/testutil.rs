// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test doubles for the recorder's input and output seams.

use crate::mpegts::VideoPacket;
use crate::segment::{SegmentSink, SinkOpener};
use crate::stream::{Opener, Stream};
use base::clock::{Clocks, SimulatedClocks};
use base::{bail, Error};
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stands in for a stream's PSI packets.
pub const FAKE_INIT_DATA: &[u8] = b"\x47PSI";

/// A scripted camera: each entry is (milliseconds since the previous
/// packet, keyframe flag). The simulated clock advances accordingly before
/// each packet is handed out, emulating a camera delivering in real time.
pub struct ScriptedOpener {
    clocks: SimulatedClocks,
    script: Mutex<Option<VecDeque<(u64, bool)>>>,
}

impl ScriptedOpener {
    pub fn new(clocks: SimulatedClocks, script: Vec<(u64, bool)>) -> Self {
        ScriptedOpener {
            clocks,
            script: Mutex::new(Some(script.into())),
        }
    }
}

impl Opener for ScriptedOpener {
    fn open(&self, _url: &str) -> Result<Box<dyn Stream>, Error> {
        let Some(script) = self.script.lock().unwrap().take() else {
            bail!(Unavailable, msg("scripted stream already consumed"));
        };
        Ok(Box::new(ScriptedStream {
            clocks: self.clocks.clone(),
            script,
            elapsed_ms: 0,
        }))
    }
}

struct ScriptedStream {
    clocks: SimulatedClocks,
    script: VecDeque<(u64, bool)>,
    elapsed_ms: u64,
}

impl Stream for ScriptedStream {
    fn init_data(&self) -> Bytes {
        Bytes::from_static(FAKE_INIT_DATA)
    }

    fn next(&mut self) -> Result<Option<VideoPacket>, Error> {
        let Some((delta_ms, is_key)) = self.script.pop_front() else {
            return Ok(None);
        };
        self.clocks.sleep(Duration::from_millis(delta_ms));
        self.elapsed_ms += delta_ms;
        Ok(Some(VideoPacket {
            pts_90k: Some((self.elapsed_ms * 90) as i64),
            is_key,
            data: Bytes::from(vec![if is_key { 0x4b } else { 0x70 }; 188]),
        }))
    }
}

/// What a fake sink saw, per segment.
#[derive(Clone, Debug)]
pub struct SegmentRecord {
    pub file: String,
    pub packets: usize,
    pub first_packet_key: bool,
    pub finished: bool,
}

#[derive(Debug)]
pub struct SinkLog(Mutex<Vec<SegmentRecord>>);

impl SinkLog {
    pub fn segments(&self) -> Vec<SegmentRecord> {
        self.0.lock().unwrap().clone()
    }

    /// An opener whose sinks record everything and never fail.
    pub fn new_opener() -> LogSinkOpener {
        LogSinkOpener {
            log: Arc::new(SinkLog(Mutex::new(Vec::new()))),
            fail_on_write: None,
            writes: Arc::new(Mutex::new(0)),
        }
    }

    /// An opener that fails the write after the `n`th successful one, once,
    /// across all its sinks.
    pub fn new_opener_failing_after(n: u64) -> LogSinkOpener {
        LogSinkOpener {
            log: Arc::new(SinkLog(Mutex::new(Vec::new()))),
            fail_on_write: Some(n + 1),
            writes: Arc::new(Mutex::new(0)),
        }
    }
}

pub struct LogSinkOpener {
    pub log: Arc<SinkLog>,
    fail_on_write: Option<u64>,
    writes: Arc<Mutex<u64>>,
}

impl SinkOpener for LogSinkOpener {
    fn create(&self, path: &Path, init_data: &[u8]) -> Result<Box<dyn SegmentSink>, Error> {
        assert_eq!(init_data, FAKE_INIT_DATA);
        let file = path
            .file_name()
            .expect("segment path has a basename")
            .to_str()
            .unwrap()
            .to_owned();
        let index = {
            let mut l = self.log.0.lock().unwrap();
            l.push(SegmentRecord {
                file,
                packets: 0,
                first_packet_key: false,
                finished: false,
            });
            l.len() - 1
        };
        Ok(Box::new(LogSink {
            log: self.log.clone(),
            index,
            fail_on_write: self.fail_on_write,
            writes: self.writes.clone(),
        }))
    }
}

#[derive(Debug)]
struct LogSink {
    log: Arc<SinkLog>,
    index: usize,
    fail_on_write: Option<u64>,
    writes: Arc<Mutex<u64>>,
}

impl SegmentSink for LogSink {
    fn write(&mut self, pkt: &VideoPacket) -> Result<(), Error> {
        {
            let mut w = self.writes.lock().unwrap();
            *w += 1;
            if self.fail_on_write == Some(*w) {
                bail!(ResourceExhausted, msg("no space left on device"));
            }
        }
        let mut l = self.log.0.lock().unwrap();
        let rec = &mut l[self.index];
        if rec.packets == 0 {
            rec.first_packet_key = pkt.is_key;
        }
        rec.packets += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.log.0.lock().unwrap()[self.index].finished = true;
        Ok(())
    }
}
