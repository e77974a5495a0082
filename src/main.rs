// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod heartbeat;
mod mpegts;
mod playback;
mod recorder;
mod segment;
mod stream;
mod supervisor;
mod writer;

#[cfg(test)]
mod testutil;

/// DSS Edge: edge video management core.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    Record(#[bpaf(external(cmds::record::args))] cmds::record::Args),
    Playback(#[bpaf(external(cmds::playback::args))] cmds::playback::Args),
    Supervise(#[bpaf(external(cmds::supervise::args))] cmds::supervise::Args),
    Heartbeat(#[bpaf(external(cmds::heartbeat::args))] cmds::heartbeat::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Record(a) => cmds::record::run(a),
            Args::Playback(a) => cmds::playback::run(a),
            Args::Supervise(a) => cmds::supervise::run(a),
            Args::Heartbeat(a) => cmds::heartbeat::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!("clock_gettime failed: {e}\n\nThis indicates a broken environment.");
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/dss-edge`: `dss-edge`), falling back to the crate name
    // if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
