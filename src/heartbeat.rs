// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The system heartbeat daemon: samples disk, CPU, memory, and orchestrator
//! liveness every two seconds and publishes an atomic JSON snapshot.
//!
//! Readers never observe a partial document: the snapshot is written to
//! `<path>.tmp` and renamed over `<path>`.

use base::clock::Clocks;
use base::{Error, ErrorKind, ResultExt as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SNAPSHOT_FILE: &str = "/tmp/dss-system.hb";
pub const DEFAULT_PID_FILE: &str = "/run/dss/orchestrator.pid";
pub const DEFAULT_ORCHESTRATOR_CMDLINE: &str = "edgeOrchestrator.js";

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// One published health snapshot.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Wall-clock sample time, seconds since the Unix epoch.
    pub ts: i64,

    /// Disk usage percent for the configured record path; -1 if unknown.
    pub hdd: i64,

    /// CPU usage percent; 0 on the warm-up sample after boot.
    pub cpu: i64,

    /// Memory usage percent; -1 if unknown.
    pub mem: i64,

    /// Whether the orchestrator process is alive and really the
    /// orchestrator (PID-reuse is checked against its command line).
    pub orch: bool,

    /// Required configuration is missing.
    pub err: bool,
}

impl Snapshot {
    /// Publishes by write-then-rename so a reader sees the old document or
    /// the new one, never a torn one.
    pub fn write_atomic(&self, path: &Path) -> Result<(), Error> {
        let tmp = path.with_extension("hb.tmp");
        let json = serde_json::to_vec(self).err_kind(ErrorKind::Internal)?;
        std::fs::write(&tmp, json).err_kind(ErrorKind::Internal)?;
        std::fs::rename(&tmp, path).err_kind(ErrorKind::Internal)
    }

    pub fn read(path: &Path) -> Result<Snapshot, Error> {
        let data = std::fs::read(path).err_kind(ErrorKind::NotFound)?;
        serde_json::from_slice(&data).err_kind(ErrorKind::DataLoss)
    }
}

/// Aggregate CPU time counters from the first line of `/proc/stat`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    fn busy_total(&self) -> u64 {
        self.user + self.nice + self.system + self.irq + self.softirq + self.steal
    }
}

/// Parses an aggregate `cpu ...` line from `/proc/stat`.
pub fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return None;
    }
    let mut next = || fields.next()?.parse::<u64>().ok();
    Some(CpuTimes {
        user: next()?,
        nice: next()?,
        system: next()?,
        idle: next()?,
        iowait: next()?,
        irq: next()?,
        softirq: next()?,
        steal: next().unwrap_or(0),
    })
}

pub fn read_cpu() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(stat.lines().next()?)
}

/// Usage percent from two successive counter reads: busy delta over total
/// delta.
pub fn cpu_percent(prev: &CpuTimes, cur: &CpuTimes) -> i64 {
    let prev_total = prev.idle_total() + prev.busy_total();
    let cur_total = cur.idle_total() + cur.busy_total();
    let total = cur_total.saturating_sub(prev_total);
    let idle = cur.idle_total().saturating_sub(prev.idle_total());
    if total == 0 {
        return 0;
    }
    ((total - idle) * 100 / total) as i64
}

/// Disk usage percent (total minus available) for `path`; -1 if the path is
/// unset or can't be statted.
pub fn disk_percent(path: &Path) -> i64 {
    if path.as_os_str().is_empty() {
        return -1;
    }
    let vfs = match nix::sys::statvfs::statvfs(path) {
        Ok(vfs) => vfs,
        Err(_) => return -1,
    };
    let total = vfs.blocks() as u64 * vfs.fragment_size() as u64;
    let avail = vfs.blocks_available() as u64 * vfs.fragment_size() as u64;
    if total == 0 {
        return 0;
    }
    ((total - avail) * 100 / total) as i64
}

/// Parses `MemTotal`/`MemFree` (in kB) out of `/proc/meminfo` content.
pub fn parse_meminfo(s: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut free = None;
    for line in s.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total = fields.next()?.parse().ok(),
            Some("MemFree:") => free = fields.next()?.parse().ok(),
            _ => {}
        }
        if let (Some(t), Some(f)) = (total, free) {
            return Some((t, f));
        }
    }
    None
}

/// Memory usage percent (total minus free); -1 if unknown.
pub fn memory_percent() -> i64 {
    let Some((total, free)) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .as_deref()
        .and_then(parse_meminfo)
    else {
        return -1;
    };
    if total == 0 {
        return 0;
    }
    ((total - free) * 100 / total) as i64
}

/// True iff the PID named in `pid_file` exists *and* its command line
/// contains `expect`. The second check defends against PID reuse after an
/// orchestrator crash.
pub fn orchestrator_alive(pid_file: &Path, expect: &str) -> bool {
    let Some(pid) = std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    else {
        return false;
    };
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    // argv is NUL-separated.
    let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");
    cmdline.contains(expect)
}

pub struct Config {
    /// Path whose filesystem is measured for disk pressure; empty means
    /// unconfigured, which raises the snapshot's `err` flag.
    pub record_path: PathBuf,
    pub snapshot_file: PathBuf,
    pub pid_file: PathBuf,
    pub orchestrator_cmdline: String,
}

pub struct Daemon {
    pub cfg: Config,
}

impl Daemon {
    /// Samples and publishes until shutdown. The first CPU figure after
    /// boot is reported as 0 while the counters warm up.
    pub fn run<C: Clocks>(&self, clocks: &C) {
        info!(
            record_path = %self.cfg.record_path.display(),
            snapshot = %self.cfg.snapshot_file.display(),
            "heartbeat daemon started"
        );
        let mut prev_cpu = read_cpu();
        let mut warmed = false;
        while !base::shutdown::signals::requested() {
            clocks.sleep(SAMPLE_INTERVAL);
            let cur_cpu = read_cpu();
            let cpu = match (warmed, &prev_cpu, &cur_cpu) {
                (true, Some(prev), Some(cur)) => cpu_percent(prev, cur),
                _ => 0,
            };
            let snapshot = Snapshot {
                ts: clocks.realtime_ms() / 1000,
                hdd: disk_percent(&self.cfg.record_path),
                cpu,
                mem: memory_percent(),
                orch: orchestrator_alive(&self.cfg.pid_file, &self.cfg.orchestrator_cmdline),
                err: self.cfg.record_path.as_os_str().is_empty(),
            };
            if let Err(e) = snapshot.write_atomic(&self.cfg.snapshot_file) {
                warn!(err = %e.chain(), "unable to publish snapshot");
            }
            prev_cpu = cur_cpu;
            warmed = true;
        }
        info!("heartbeat daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_stat_line() {
        let t = parse_cpu_line("cpu  4705 150 1120 1634525 845 0 55 0 0 0").unwrap();
        assert_eq!(t.user, 4705);
        assert_eq!(t.idle, 1634525);
        assert_eq!(t.steal, 0);
        assert!(parse_cpu_line("cpu0 1 2 3 4 5 6 7 8").is_none());
        assert!(parse_cpu_line("intr 12345").is_none());
    }

    #[test]
    fn cpu_percent_differences_counters() {
        let prev = CpuTimes {
            user: 100,
            system: 50,
            idle: 800,
            iowait: 50,
            ..Default::default()
        };
        // +60 busy, +40 idle => 60%.
        let cur = CpuTimes {
            user: 150,
            system: 60,
            idle: 830,
            iowait: 60,
            ..Default::default()
        };
        assert_eq!(cpu_percent(&prev, &cur), 60);
        assert_eq!(cpu_percent(&prev, &prev), 0); // no elapsed ticks
    }

    #[test]
    fn parses_meminfo() {
        let s = "MemTotal:       16384000 kB\nMemFree:         4096000 kB\nBuffers: 1 kB\n";
        assert_eq!(parse_meminfo(s), Some((16384000, 4096000)));
        assert_eq!(parse_meminfo("Buffers: 1 kB\n"), None);
    }

    #[test]
    fn snapshot_roundtrip_through_atomic_write() {
        db::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.hb");
        let s = Snapshot {
            ts: 1_700_000_000,
            hdd: 91,
            cpu: 12,
            mem: 40,
            orch: true,
            err: false,
        };
        s.write_atomic(&path).unwrap();
        assert_eq!(Snapshot::read(&path).unwrap(), s);
        // No temp file left behind.
        assert!(!path.with_extension("hb.tmp").exists());

        // The JSON wire format is the documented one.
        let raw = std::fs::read_to_string(&path).unwrap();
        for key in ["\"ts\":", "\"hdd\":", "\"cpu\":", "\"mem\":", "\"orch\":", "\"err\":"] {
            assert!(raw.contains(key), "{raw}");
        }
    }

    #[test]
    fn disk_percent_handles_unset_and_bogus_paths() {
        assert_eq!(disk_percent(Path::new("")), -1);
        assert_eq!(disk_percent(Path::new("/nonexistent-dir-xyz")), -1);
        let pct = disk_percent(Path::new("/"));
        assert!((0..=100).contains(&pct), "{pct}");
    }

    #[test]
    fn orchestrator_liveness_checks_cmdline() {
        db::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("orchestrator.pid");

        // Missing file.
        assert!(!orchestrator_alive(&pid_file, "anything"));

        // Current process exists, but its command line isn't the
        // orchestrator's: the PID-reuse defense must reject it.
        std::fs::write(&pid_file, format!("{}", std::process::id())).unwrap();
        assert!(!orchestrator_alive(&pid_file, "edgeOrchestrator.js"));

        // The current test binary matches a substring of its own cmdline.
        #[cfg(target_os = "linux")]
        assert!(orchestrator_alive(&pid_file, "dss"));
    }
}
