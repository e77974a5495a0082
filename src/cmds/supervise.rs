// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand: the supervisor process.

use crate::heartbeat;
use crate::recorder;
use crate::supervisor::{self, ChildSpec, Config, RedisChannel, Supervisor};
use base::clock::RealClocks;
use base::{Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use serde::Deserialize;
use std::path::PathBuf;

/// Spawns and supervises the heartbeat daemon and the orchestrator,
/// applying health and retention policies every five seconds.
#[derive(Bpaf, Debug)]
pub struct Args {
    /// Optional TOML file overriding the orchestrator child and paths.
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Message channel URL for retention triggers.
    #[bpaf(long, argument("URL"), fallback(supervisor::DEFAULT_REDIS_URL.into()))]
    redis_url: String,

    /// Path whose filesystem the heartbeat daemon measures.
    #[bpaf(long, argument("PATH"), fallback("/opt/dss-edge/storage".into()))]
    record_path: PathBuf,
}

/// The TOML config surface; everything is optional on top of the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    orchestrator: Option<ChildSpec>,
    snapshot_file: Option<PathBuf>,
    recorder_hb_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    redis_url: Option<String>,
}

fn load_file_config(path: Option<&PathBuf>) -> Result<FileConfig, Error> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path).err_kind(ErrorKind::NotFound)?;
    toml::from_str(&raw).err_kind(ErrorKind::InvalidArgument)
}

fn default_orchestrator(record_path: &std::path::Path) -> ChildSpec {
    ChildSpec {
        name: "orchestrator".to_owned(),
        program: "/usr/bin/node".into(),
        args: vec!["/opt/dss-edge/orchestrator/edgeOrchestrator.js".to_owned()],
        env: vec![(
            "DSS_RECORD_PATH".to_owned(),
            record_path.display().to_string(),
        )],
    }
}

fn heartbeat_child(record_path: &std::path::Path) -> Result<ChildSpec, Error> {
    let exe = std::env::current_exe().err_kind(ErrorKind::Internal)?;
    Ok(ChildSpec {
        name: "heartbeat".to_owned(),
        program: exe,
        args: vec![
            "heartbeat".to_owned(),
            "--record-path".to_owned(),
            record_path.display().to_string(),
        ],
        env: vec![],
    })
}

pub fn run(args: Args) -> Result<i32, Error> {
    base::shutdown::signals::install();
    let file = load_file_config(args.config.as_ref())?;
    let cfg = Config {
        snapshot_file: file
            .snapshot_file
            .unwrap_or_else(|| heartbeat::DEFAULT_SNAPSHOT_FILE.into()),
        recorder_hb_file: file
            .recorder_hb_file
            .unwrap_or_else(|| recorder::DEFAULT_HEARTBEAT_FILE.into()),
        log_file: file
            .log_file
            .unwrap_or_else(|| supervisor::DEFAULT_LOG_FILE.into()),
        orchestrator: file
            .orchestrator
            .unwrap_or_else(|| default_orchestrator(&args.record_path)),
        heartbeat: heartbeat_child(&args.record_path)?,
    };
    let redis_url = file.redis_url.unwrap_or(args.redis_url);
    let mut channel = RedisChannel::new(&redis_url)?;
    let clocks = RealClocks {};
    Supervisor {
        clocks: &clocks,
        cfg,
        channel: &mut channel,
    }
    .run();
    Ok(0)
}
