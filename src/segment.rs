// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recorder's output side: one sink per segment file.
//!
//! Container encoding already happened upstream (the access units are raw
//! transport packets), so a sink's job is ordering and persistence: stream
//! init data first, then access units, then flush. Two strategies exist:
//! [`FileSinkOpener`] streams straight to the file, [`PooledSinkOpener`]
//! buffers the whole segment and hands it to the writer pool on close.

use crate::mpegts::VideoPacket;
use crate::writer::{WriteJob, WriterPool};
use base::{Error, ErrorKind, ResultExt as _};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Creates the per-segment sink. This is a trait for test injection.
pub trait SinkOpener: Send + Sync {
    fn create(&self, path: &Path, init_data: &[u8]) -> Result<Box<dyn SegmentSink>, Error>;
}

pub trait SegmentSink: Send + std::fmt::Debug {
    fn write(&mut self, pkt: &VideoPacket) -> Result<(), Error>;

    /// Completes the segment. The file must be fully visible on disk (or
    /// queued for persistence) when this returns.
    fn finish(&mut self) -> Result<(), Error>;
}

/// Streams packets directly into the segment file.
pub struct FileSinkOpener;

impl SinkOpener for FileSinkOpener {
    fn create(&self, path: &Path, init_data: &[u8]) -> Result<Box<dyn SegmentSink>, Error> {
        let f = std::fs::File::create(path).err_kind(ErrorKind::Internal)?;
        let mut w = std::io::BufWriter::new(f);
        w.write_all(init_data).err_kind(ErrorKind::Internal)?;
        Ok(Box::new(FileSink { w }))
    }
}

#[derive(Debug)]
struct FileSink {
    w: std::io::BufWriter<std::fs::File>,
}

impl SegmentSink for FileSink {
    fn write(&mut self, pkt: &VideoPacket) -> Result<(), Error> {
        self.w.write_all(&pkt.data).err_kind(ErrorKind::Internal)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.w.flush().err_kind(ErrorKind::Internal)
    }
}

/// Buffers the whole segment in memory and submits it to the writer pool on
/// close, keeping even the file I/O off the packet loop.
pub struct PooledSinkOpener {
    pub pool: Arc<WriterPool>,
}

impl SinkOpener for PooledSinkOpener {
    fn create(&self, path: &Path, init_data: &[u8]) -> Result<Box<dyn SegmentSink>, Error> {
        Ok(Box::new(PooledSink {
            path: path.to_owned(),
            buf: init_data.to_vec(),
            pool: self.pool.clone(),
        }))
    }
}

#[derive(Debug)]
struct PooledSink {
    path: PathBuf,
    buf: Vec<u8>,
    pool: Arc<WriterPool>,
}

impl SegmentSink for PooledSink {
    fn write(&mut self, pkt: &VideoPacket) -> Result<(), Error> {
        self.buf.extend_from_slice(&pkt.data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.pool.submit(WriteJob {
            path: std::mem::take(&mut self.path),
            data: std::mem::take(&mut self.buf),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(byte: u8, n: usize) -> VideoPacket {
        VideoPacket {
            pts_90k: None,
            is_key: false,
            data: Bytes::from(vec![byte; n]),
        }
    }

    #[test]
    fn file_sink_writes_init_then_packets() {
        db::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000.ts");
        let mut sink = FileSinkOpener.create(&path, &[1, 2, 3]).unwrap();
        sink.write(&pkt(9, 4)).unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), &[1, 2, 3, 9, 9, 9, 9]);
    }

    #[test]
    fn file_sink_create_fails_on_missing_dir() {
        db::testutil::init();
        let e = FileSinkOpener
            .create(Path::new("/nonexistent-dir/000000.ts"), &[])
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn pooled_sink_persists_on_finish() {
        db::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.ts");
        let pool = Arc::new(WriterPool::new(1, 4));
        let opener = PooledSinkOpener { pool: pool.clone() };
        let mut sink = opener.create(&path, &[7]).unwrap();
        sink.write(&pkt(8, 2)).unwrap();
        sink.finish().unwrap();
        drop(sink);
        drop(opener);
        drop(pool); // drains the queue
        assert_eq!(std::fs::read(&path).unwrap(), &[7, 8, 8]);
    }
}
