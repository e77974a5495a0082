// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand: the system heartbeat daemon.

use crate::heartbeat::{self, Config, Daemon};
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::warn;

/// Samples system health every two seconds and publishes the snapshot by
/// atomic rename. Runs until SIGTERM/SIGINT.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// Path whose filesystem is measured for disk pressure. Falls back to
    /// $DSS_RECORD_PATH; left unset, the snapshot carries `err: true`.
    #[bpaf(long, argument("PATH"))]
    record_path: Option<PathBuf>,

    /// Where the JSON snapshot is published.
    #[bpaf(
        long,
        argument("PATH"),
        fallback(PathBuf::from(heartbeat::DEFAULT_SNAPSHOT_FILE))
    )]
    snapshot_file: PathBuf,

    /// Orchestrator PID file to verify liveness against.
    #[bpaf(
        long,
        argument("PATH"),
        fallback(PathBuf::from(heartbeat::DEFAULT_PID_FILE))
    )]
    pid_file: PathBuf,

    /// Substring the orchestrator's command line must contain (defends
    /// against PID reuse).
    #[bpaf(
        long,
        argument("SUBSTR"),
        fallback(heartbeat::DEFAULT_ORCHESTRATOR_CMDLINE.into())
    )]
    orchestrator_cmdline: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::shutdown::signals::install();
    let record_path = args
        .record_path
        .or_else(|| std::env::var_os("DSS_RECORD_PATH").map(PathBuf::from))
        .unwrap_or_default();
    if let Some(dir) = args.pid_file.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), err = %e, "unable to create pid file directory");
        }
    }
    let daemon = Daemon {
        cfg: Config {
            record_path,
            snapshot_file: args.snapshot_file,
            pid_file: args.pid_file,
            orchestrator_cmdline: args.orchestrator_cmdline,
        },
    };
    daemon.run(&RealClocks {});
    Ok(0)
}
