// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Utilities for automated testing involving DSS Edge's persistence layer.
//! Used by tests of both the `dss_db` crate itself and the `dss_edge` crate.

use crate::archive::Archive;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging. (Note the
/// output can be confusing unless `RUST_TEST_THREADS=1` is set in the
/// program's environment prior to running.)
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

/// A fresh archive in a temporary directory, removed on drop.
pub struct TestArchive {
    pub archive: Archive,
    pub tmpdir: tempfile::TempDir,
}

impl TestArchive {
    pub fn new() -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("dss-edge-test")
            .tempdir()
            .unwrap();
        let archive = Archive::open(tmpdir.path()).unwrap();
        TestArchive { archive, tmpdir }
    }
}

impl Default for TestArchive {
    fn default() -> Self {
        Self::new()
    }
}
