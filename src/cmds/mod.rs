// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::{Error, ErrorKind, ResultExt as _};
use nix::fcntl::FlockArg;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub mod heartbeat;
pub mod playback;
pub mod record;
pub mod supervise;

/// An exclusive per-camera instance lock. Held (and its file removed) until
/// drop; a second recorder for the same camera fails to acquire it.
#[derive(Debug)]
pub struct InstanceLock {
    /// Keeps the locked fd open; flock releases on close.
    _file: std::fs::File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .err_kind(ErrorKind::Internal)?;
        #[allow(deprecated)]
        nix::fcntl::flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            base::err!(
                AlreadyExists,
                msg("unable to lock {}", path.display()),
                source(e)
            )
        })?;
        Ok(InstanceLock {
            _file: file,
            path: path.to_owned(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_fails_while_first_is_held() {
        db::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recorder_cam1.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert_eq!(second.unwrap_err().kind(), ErrorKind::AlreadyExists);
        drop(first);
        assert!(!path.exists());
        InstanceLock::acquire(&path).unwrap();
    }
}
