// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Companion event log (`ai.db`): detections produced by the motion
//! consumer process, one row per event.

use crate::index::Time;
use rusqlite::params;
use std::path::Path;
use tracing::error;

const INIT_SQL: &str = r#"
    create table if not exists events (
      ts integer not null,
      type text not null,
      confidence real not null,
      bbox text not null
    );
"#;

/// Append-only event sink with the same degraded-on-failure contract as the
/// timeline index.
pub struct EventLog {
    conn: Option<rusqlite::Connection>,
}

impl EventLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let conn = rusqlite::Connection::open(path)
            .and_then(|c| c.execute_batch(INIT_SQL).map(|()| c));
        let conn = match conn {
            Ok(c) => Some(c),
            Err(e) => {
                error!(path = %path.display(), err = %e, "unable to open event log; degrading to no-op");
                None
            }
        };
        EventLog { conn }
    }

    pub fn insert(&mut self, ts: Time, type_: &str, confidence: f64, bbox: &str) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let r = conn
            .prepare_cached("insert into events (ts, type, confidence, bbox) values (?1, ?2, ?3, ?4)")
            .and_then(|mut stmt| stmt.execute(params![ts.0, type_, confidence, bbox]));
        if let Err(e) = r {
            error!(err = %e, "unable to insert event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn insert_and_reopen() {
        testutil::init();
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("ai.db");
        {
            let mut log = EventLog::open(&path);
            log.insert(Time(1_000), "person", 0.87, "[10,20,30,40]");
        }
        let log = EventLog::open(&path);
        let n: i64 = log
            .conn
            .as_ref()
            .unwrap()
            .query_row("select count(*) from events", params![], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
