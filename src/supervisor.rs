// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The supervisor: keeps the heartbeat daemon and the orchestrator running,
//! consumes the health snapshot, and publishes retention triggers under
//! disk pressure.
//!
//! Policy summary (per 5-second tick):
//! - dead children are restarted, with anti-flap backoff;
//! - a snapshot older than 30 s is logged and otherwise ignored;
//! - orchestrator reported dead while the system has been up ≥ 60 s ⇒ the
//!   orchestrator child is stopped so the next tick restarts it;
//! - every 30 s the disk figure is published, with `aggressive` at ≥ 95 %
//!   and `normal` at ≥ 90 %;
//! - a stale recorder freshness file is logged only — freezes are not
//!   restart-eligible in this revision.

use crate::heartbeat::Snapshot;
use base::clock::Clocks;
use base::{Error, ErrorKind, ResultExt as _};
use serde::Deserialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const SNAPSHOT_STALE_AFTER: Duration = Duration::from_secs(30);
pub const RECORDER_FROZEN_AFTER: Duration = Duration::from_secs(30);
pub const ORCHESTRATOR_GRACE: Duration = Duration::from_secs(60);
pub const DISK_PUBLISH_INTERVAL: Duration = Duration::from_secs(30);
pub const STOP_GRACE: Duration = Duration::from_secs(2);

pub const DISK_ACTION_LEVEL: i64 = 90;
pub const DISK_EMERGENCY_LEVEL: i64 = 95;
pub const CPU_ALERT_LEVEL: i64 = 95;

pub const DEFAULT_LOG_FILE: &str = "/var/log/dss-supervisor.log";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";

/// How to start one supervised child: a program and its argv tail, plus
/// environment additions. No shell is involved.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// A child process with start/stop/is_alive. Stopping is SIGTERM, a
/// 2-second grace window, then SIGKILL.
pub struct SupervisedChild {
    spec: ChildSpec,
    child: Option<Child>,
}

impl SupervisedChild {
    pub fn new(spec: ChildSpec) -> Self {
        SupervisedChild { spec, child: None }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn start(&mut self) {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args).stdin(Stdio::null());
        for (k, v) in &self.spec.env {
            cmd.env(k, v);
        }
        match cmd.spawn() {
            Ok(child) => {
                info!(name = self.spec.name, pid = child.id(), "started child");
                self.child = Some(child);
            }
            Err(e) => {
                warn!(name = self.spec.name, err = %e, "unable to start child");
                self.child = None;
            }
        }
    }

    /// Non-blocking liveness check; reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                info!(name = self.spec.name, %status, "child exited");
                self.child = None;
                false
            }
            Some(Err(e)) => {
                warn!(name = self.spec.name, err = %e, "unable to poll child");
                false
            }
            None => false,
        }
    }

    pub fn stop<C: Clocks>(&mut self, clocks: &C) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        let deadline = clocks.monotonic() + STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(name = self.spec.name, %status, "child stopped");
                    self.child = None;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(name = self.spec.name, err = %e, "unable to poll child");
                    break;
                }
            }
            if clocks.monotonic() >= deadline {
                break;
            }
            clocks.sleep(Duration::from_millis(100));
        }
        warn!(name = self.spec.name, "child ignored SIGTERM; killing");
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionLevel {
    Normal,
    Aggressive,
}

impl RetentionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RetentionLevel::Normal => "normal",
            RetentionLevel::Aggressive => "aggressive",
        }
    }
}

/// The retention trigger for a disk usage figure, if any.
pub fn retention_level(hdd: i64) -> Option<RetentionLevel> {
    if hdd >= DISK_EMERGENCY_LEVEL {
        Some(RetentionLevel::Aggressive)
    } else if hdd >= DISK_ACTION_LEVEL {
        Some(RetentionLevel::Normal)
    } else {
        None
    }
}

/// Fan-out of retention decisions to the message channel. Implementations
/// absorb their own transport errors: supervision must not depend on the
/// channel being up.
pub trait RetentionChannel: Send {
    /// Reflects the last sampled disk usage under `hb:disk_usage`.
    fn publish_disk_usage(&mut self, pct: i64);

    /// Sets and publishes `state:retention:trigger`.
    fn publish_trigger(&mut self, level: RetentionLevel);
}

/// Redis-backed channel, reconnecting lazily after failures.
pub struct RedisChannel {
    client: redis::Client,
    conn: Option<redis::Connection>,
}

impl RedisChannel {
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).err_kind(ErrorKind::InvalidArgument)?;
        Ok(RedisChannel { client, conn: None })
    }

    fn with_conn(&mut self, f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<()>) {
        if self.conn.is_none() {
            match self.client.get_connection() {
                Ok(c) => self.conn = Some(c),
                Err(e) => {
                    warn!(err = %e, "unable to connect to message channel");
                    return;
                }
            }
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = f(conn) {
                warn!(err = %e, "message channel publish failed");
                self.conn = None;
            }
        }
    }
}

impl RetentionChannel for RedisChannel {
    fn publish_disk_usage(&mut self, pct: i64) {
        self.with_conn(|conn| {
            redis::cmd("SET")
                .arg("hb:disk_usage")
                .arg(pct)
                .query::<()>(conn)
        });
    }

    fn publish_trigger(&mut self, level: RetentionLevel) {
        self.with_conn(|conn| {
            redis::cmd("SET")
                .arg("state:retention:trigger")
                .arg(level.as_str())
                .query::<()>(conn)?;
            redis::cmd("PUBLISH")
                .arg("state:retention:trigger")
                .arg(level.as_str())
                .query::<()>(conn)
        });
    }
}

/// Restart accounting with anti-flap: more than 3 restarts within 60
/// seconds earns a 30-second pause and a counter reset; 5 quiet minutes
/// also reset the counter.
pub struct FlapGuard {
    restarts: u32,
    last_restart: Option<Duration>,
}

impl FlapGuard {
    pub fn new() -> Self {
        FlapGuard {
            restarts: 0,
            last_restart: None,
        }
    }

    /// Records a restart; returns how long to pause first, if flapping.
    pub fn on_restart(&mut self, now: Duration) -> Option<Duration> {
        self.restarts += 1;
        let pause = match self.last_restart {
            Some(last) if self.restarts > 3 && now.saturating_sub(last) < Duration::from_secs(60) => {
                self.restarts = 0;
                Some(Duration::from_secs(30))
            }
            _ => None,
        };
        self.last_restart = Some(now);
        pause
    }

    /// Forgets old restarts after 5 quiet minutes.
    pub fn decay(&mut self, now: Duration) {
        if let Some(last) = self.last_restart {
            if self.restarts > 0 && now.saturating_sub(last) > Duration::from_secs(300) {
                self.restarts = 0;
            }
        }
    }

    #[cfg(test)]
    fn restarts(&self) -> u32 {
        self.restarts
    }
}

impl Default for FlapGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable append log (`/var/log/dss-supervisor.log` by default),
/// mirrored to `tracing` for the journal.
pub struct SupervisorLog {
    file: Option<std::fs::File>,
}

impl SupervisorLog {
    pub fn open(path: &Path) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);
        let file = match file {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "unable to open supervisor log");
                None
            }
        };
        SupervisorLog { file }
    }

    pub fn log(&mut self, msg: &str) {
        info!("{msg}");
        if let Some(f) = self.file.as_mut() {
            let stamp = jiff::Zoned::now().strftime("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(f, "[{stamp}] {msg}");
        }
    }
}

pub struct Config {
    pub snapshot_file: PathBuf,
    pub recorder_hb_file: PathBuf,
    pub log_file: PathBuf,
    pub orchestrator: ChildSpec,
    pub heartbeat: ChildSpec,
}

/// The supervisor's policy state, separated from process plumbing so ticks
/// are testable with simulated clocks and fake channels.
pub struct Policy {
    flap: FlapGuard,
    last_disk_publish: Option<Duration>,
    orchestrator_started: Duration,
}

/// What one policy evaluation decided.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Actions {
    pub stop_orchestrator: bool,
    pub publish_disk: Option<i64>,
    pub trigger: Option<RetentionLevel>,
}

impl Policy {
    pub fn new(now: Duration) -> Self {
        Policy {
            flap: FlapGuard::new(),
            last_disk_publish: None,
            orchestrator_started: now,
        }
    }

    pub fn on_orchestrator_restart(&mut self, now: Duration) -> Option<Duration> {
        self.orchestrator_started = now;
        self.flap.on_restart(now)
    }

    pub fn decay(&mut self, now: Duration) {
        self.flap.decay(now);
    }

    /// Applies the snapshot policies. `wall_secs` is current wall-clock
    /// seconds, comparable to `Snapshot::ts`.
    pub fn evaluate(
        &mut self,
        snapshot: Option<&Snapshot>,
        wall_secs: i64,
        now: Duration,
        log: &mut SupervisorLog,
    ) -> Actions {
        let mut actions = Actions::default();
        let Some(s) = snapshot else {
            log.log("system heartbeat invalid; system degraded");
            return actions;
        };
        if wall_secs - s.ts > SNAPSHOT_STALE_AFTER.as_secs() as i64 {
            log.log("system heartbeat stale; system degraded");
            return actions;
        }

        if !s.orch && now.saturating_sub(self.orchestrator_started) >= ORCHESTRATOR_GRACE {
            log.log("heartbeat reports orchestrator dead; stopping it for restart");
            actions.stop_orchestrator = true;
        }

        let due = match self.last_disk_publish {
            None => true,
            Some(last) => now.saturating_sub(last) >= DISK_PUBLISH_INTERVAL,
        };
        if due {
            actions.publish_disk = Some(s.hdd);
            actions.trigger = retention_level(s.hdd);
            if let Some(level) = actions.trigger {
                log.log(&format!(
                    "disk usage at {}%; retention trigger {}",
                    s.hdd,
                    level.as_str()
                ));
            }
            self.last_disk_publish = Some(now);
        }

        if s.cpu > CPU_ALERT_LEVEL {
            log.log(&format!("heavy cpu load: {}%", s.cpu));
        }
        actions
    }
}

/// Age check of the per-recorder freshness file; log-only.
pub fn recorder_frozen(hb_file: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(hb_file) else {
        return false; // no recorder running here
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    let Ok(age) = mtime.elapsed() else {
        return false;
    };
    age > RECORDER_FROZEN_AFTER
}

/// The long-lived supervisor loop.
pub struct Supervisor<'a, C: Clocks> {
    pub clocks: &'a C,
    pub cfg: Config,
    pub channel: &'a mut dyn RetentionChannel,
}

impl<'a, C: Clocks> Supervisor<'a, C> {
    pub fn run(&mut self) {
        let mut log = SupervisorLog::open(&self.cfg.log_file);
        log.log("supervisor started");

        let mut hb_daemon = SupervisedChild::new(self.cfg.heartbeat.clone());
        let mut orchestrator = SupervisedChild::new(self.cfg.orchestrator.clone());
        hb_daemon.start();
        orchestrator.start();
        let mut policy = Policy::new(self.clocks.monotonic());

        while !base::shutdown::signals::requested() {
            let now = self.clocks.monotonic();

            if !hb_daemon.is_alive() {
                log.log("heartbeat daemon died; restarting");
                hb_daemon.start();
            }
            if !orchestrator.is_alive() {
                log.log("orchestrator died; restarting");
                if let Some(pause) = policy.on_orchestrator_restart(now) {
                    log.log("restart loop detected; pausing");
                    self.clocks.sleep(pause);
                }
                orchestrator.start();
            }

            let snapshot = Snapshot::read(&self.cfg.snapshot_file).ok();
            let actions = policy.evaluate(
                snapshot.as_ref(),
                self.clocks.realtime_ms() / 1000,
                now,
                &mut log,
            );
            if actions.stop_orchestrator {
                orchestrator.stop(self.clocks);
            }
            if let Some(pct) = actions.publish_disk {
                self.channel.publish_disk_usage(pct);
            }
            if let Some(level) = actions.trigger {
                self.channel.publish_trigger(level);
            }

            if recorder_frozen(&self.cfg.recorder_hb_file) {
                log.log("recorder freshness counter stale; possible freeze (no action taken)");
            }

            policy.decay(now);
            self.clocks.sleep(TICK_INTERVAL);
        }

        log.log("supervisor shutting down");
        orchestrator.stop(self.clocks);
        hb_daemon.stop(self.clocks);
    }
}
