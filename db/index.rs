// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The timeline index: a durable record of segments and per-frame markers
//! with a minimal query surface.
//!
//! All persisted timestamps are wall-clock milliseconds since the Unix
//! epoch, never container PTS: PTS is relative to an arbitrary epoch and
//! rolls over across camera reboots, while retention and playback queries
//! are phrased in wall-clock time. Packet PTS values show up only in log
//! lines.
//!
//! The writing side degrades rather than fails: if the store can't be
//! opened, a single diagnostic is logged and every later mutation becomes a
//! no-op, so the recorder's packet loop never sees an index error.

use base::{err, Error, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params};
use std::fmt;
use std::ops::{Add, Sub};
use std::path::Path;
use tracing::{debug, error};

/// A wall-clock instant in milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Time(pub i64);

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms", self.0)
    }
}

impl Add<i64> for Time {
    type Output = Time;
    fn add(self, rhs: i64) -> Time {
        Time(self.0 + rhs)
    }
}

impl Sub for Time {
    type Output = i64;
    fn sub(self, rhs: Time) -> i64 {
        self.0 - rhs.0
    }
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct SegmentId(pub i64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One row of the `segments` table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentRow {
    pub id: SegmentId,
    pub file: String,

    /// Wall-clock creation time; set once, never changed.
    pub start: Time,

    /// Wall-clock close time, or `Time(0)` while the segment is open.
    pub end: Time,
}

const INIT_SQL: &str = r#"
    create table if not exists segments (
      id integer primary key autoincrement,
      file text not null,
      start_ts integer not null,
      end_ts integer not null default 0
    );
    create table if not exists frames (
      ts integer not null,
      keyframe integer not null,
      segment_id integer not null
    );
    create table if not exists gops (
      ts integer not null,
      file text not null,
      segment_id integer not null
    );
"#;

const OVERLAPPING_SQL: &str = r#"
    select id, file, start_ts, end_ts
    from segments
    where end_ts >= :from and start_ts <= :to
    order by id
"#;

struct CurrentSegment {
    id: SegmentId,
    file: String,
}

/// Handle to the timeline index of one archive.
///
/// A writable `Index` belongs to a single writer (the recorder pipeline);
/// readers open their own read-only connections via [`Index::open_read_only`].
pub struct Index {
    conn: Option<rusqlite::Connection>,
    current: Option<CurrentSegment>,
}

impl Index {
    /// Opens (creating if needed) the index for writing.
    ///
    /// Never fails: on error the index is returned in a degraded state in
    /// which all mutations are no-ops, after logging a one-line diagnostic.
    /// The DDL is idempotent, so reopening an existing store is a no-op.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let conn = match Self::open_writable(path) {
            Ok(c) => Some(c),
            Err(e) => {
                error!(path = %path.display(), err = %e.chain(), "unable to open index; degrading to no-op");
                None
            }
        };
        Index {
            conn,
            current: None,
        }
    }

    fn open_writable(path: &Path) -> Result<rusqlite::Connection, Error> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .err_kind(ErrorKind::Internal)?;
        conn.execute_batch(INIT_SQL).err_kind(ErrorKind::Internal)?;
        Ok(conn)
    }

    /// Opens an existing index read-only, for the playback resolver.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open_with_flags(
            path.as_ref(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .err_kind(ErrorKind::NotFound)?;
        Ok(Index {
            conn: Some(conn),
            current: None,
        })
    }

    /// True iff the store failed to open and mutations are no-ops.
    pub fn is_degraded(&self) -> bool {
        self.conn.is_none()
    }

    /// Inserts a new open segment row and makes it current.
    ///
    /// `start_pts` is the container timestamp of the seeding keyframe; it's
    /// logged for correlation but the persisted `start_ts` is `now`.
    pub fn insert_segment(
        &mut self,
        file: &str,
        start_pts: Option<i64>,
        now: Time,
    ) -> Option<SegmentId> {
        let conn = self.conn.as_mut()?;
        let r = conn
            .prepare_cached("insert into segments (file, start_ts, end_ts) values (?1, ?2, 0)")
            .and_then(|mut stmt| stmt.execute(params![file, now.0]));
        match r {
            Ok(_) => {
                let id = SegmentId(conn.last_insert_rowid());
                debug!(file, start_ts = now.0, ?start_pts, %id, "inserted segment");
                self.current = Some(CurrentSegment {
                    id,
                    file: file.to_owned(),
                });
                Some(id)
            }
            Err(e) => {
                error!(file, err = %e, "unable to insert segment");
                None
            }
        }
    }

    /// Sets the current segment's `end_ts` to `now` and clears the current
    /// segment. Does nothing if no segment is current.
    pub fn close_segment(&mut self, end_pts: Option<i64>, now: Time) {
        let (Some(conn), Some(cur)) = (self.conn.as_mut(), self.current.take()) else {
            return;
        };
        let r = conn
            .prepare_cached("update segments set end_ts = ?1 where id = ?2")
            .and_then(|mut stmt| stmt.execute(params![now.0, cur.id.0]));
        match r {
            Ok(_) => debug!(id = %cur.id, end_ts = now.0, ?end_pts, "closed segment"),
            Err(e) => error!(id = %cur.id, err = %e, "unable to close segment"),
        }
    }

    /// Appends a frame marker for the current segment; on a keyframe, also a
    /// GOP marker. Does nothing if no segment is current. The container
    /// `_pts` is accepted for interface symmetry but not persisted.
    pub fn insert_frame(&mut self, _pts: Option<i64>, is_keyframe: bool, now: Time) {
        let (Some(conn), Some(cur)) = (self.conn.as_mut(), self.current.as_ref()) else {
            return;
        };
        let r = conn
            .prepare_cached("insert into frames (ts, keyframe, segment_id) values (?1, ?2, ?3)")
            .and_then(|mut stmt| stmt.execute(params![now.0, is_keyframe as i64, cur.id.0]));
        if let Err(e) = r {
            error!(err = %e, "unable to insert frame");
            return;
        }
        if is_keyframe {
            let r = conn
                .prepare_cached("insert into gops (ts, file, segment_id) values (?1, ?2, ?3)")
                .and_then(|mut stmt| stmt.execute(params![now.0, cur.file, cur.id.0]));
            if let Err(e) = r {
                error!(err = %e, "unable to insert gop marker");
            }
        }
    }

    /// Returns the segments intersecting `[from, to]` on the wall-clock
    /// number line (`end_ts >= from and start_ts <= to`), ascending by id.
    /// Insertion order equals time order by construction, so this is also
    /// playback order.
    pub fn segments_overlapping(&self, from: Time, to: Time) -> Result<Vec<SegmentRow>, Error> {
        let Some(conn) = self.conn.as_ref() else {
            return Err(err!(FailedPrecondition, msg("index not open")));
        };
        let mut stmt = conn
            .prepare_cached(OVERLAPPING_SQL)
            .err_kind(ErrorKind::Internal)?;
        let mut rows = stmt
            .query(named_params! {":from": from.0, ":to": to.0})
            .err_kind(ErrorKind::Internal)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            out.push(SegmentRow {
                id: SegmentId(row.get(0).err_kind(ErrorKind::Internal)?),
                file: row.get(1).err_kind(ErrorKind::Internal)?,
                start: Time(row.get(2).err_kind(ErrorKind::Internal)?),
                end: Time(row.get(3).err_kind(ErrorKind::Internal)?),
            });
        }
        Ok(out)
    }

    /// Total number of segment rows, for diagnostics on empty query results.
    pub fn total_segments(&self) -> Result<i64, Error> {
        let Some(conn) = self.conn.as_ref() else {
            return Err(err!(FailedPrecondition, msg("index not open")));
        };
        conn.query_row("select count(*) from segments", params![], |row| row.get(0))
            .err_kind(ErrorKind::Internal)
    }

    /// Removes a segment row together with its frame and GOP markers, in one
    /// transaction. For the retention housekeeper, which deletes the file in
    /// the same operation.
    pub fn delete_segment(&mut self, id: SegmentId) -> Result<(), Error> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(err!(FailedPrecondition, msg("index not open")));
        };
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        tx.execute("delete from frames where segment_id = ?1", params![id.0])
            .err_kind(ErrorKind::Internal)?;
        tx.execute("delete from gops where segment_id = ?1", params![id.0])
            .err_kind(ErrorKind::Internal)?;
        tx.execute("delete from segments where id = ?1", params![id.0])
            .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &rusqlite::Connection {
        self.conn.as_ref().unwrap()
    }
}
