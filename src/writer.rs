// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Background persistence of opaque byte payloads, off the recorder's hot
//! path, plus the bounded ring buffer used for timed frame retention.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{error, warn};

#[derive(Debug)]
pub struct WriteJob {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct State {
    jobs: VecDeque<WriteJob>,
    running: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// A bounded FIFO drained by worker threads, each write a single
/// open-write-close cycle. Failures are logged loudly but never propagate
/// back to the submitter. On drop, queued jobs drain before the workers
/// join.
#[derive(Debug)]
pub struct WriterPool {
    shared: Arc<Shared>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl WriterPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        assert!(workers > 0 && capacity > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                running: true,
            }),
            cv: Condvar::new(),
        });
        let workers = (0..workers)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("writer-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning writer thread")
            })
            .collect();
        WriterPool {
            shared,
            capacity,
            workers,
        }
    }

    /// Enqueues a job. If the queue is full, the job is dropped with a
    /// warning; the submitter is the hot path and must never block here.
    pub fn submit(&self, job: WriteJob) {
        let mut l = self.shared.state.lock().unwrap();
        if l.jobs.len() >= self.capacity {
            warn!(path = %job.path.display(), "writer pool saturated; dropping payload");
            return;
        }
        l.jobs.push_back(job);
        drop(l);
        self.shared.cv.notify_one();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().jobs.len()
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().running = false;
        self.shared.cv.notify_all();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                error!("writer thread panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut l = shared.state.lock().unwrap();
            loop {
                if let Some(job) = l.jobs.pop_front() {
                    break job;
                }
                if !l.running {
                    return;
                }
                l = shared.cv.wait(l).unwrap();
            }
        };
        if let Err(e) = std::fs::write(&job.path, &job.data) {
            error!(path = %job.path.display(), err = %e, "unable to write payload");
        }
    }
}

/// Fixed-capacity buffer of recent items. `push` evicts the oldest;
/// `snapshot` drains everything seen so far, so it is only suitable for a
/// single consumer.
pub struct RingBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    cap: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0);
        RingBuffer {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, item: T) {
        let mut l = self.inner.lock().unwrap();
        if l.len() == self.cap {
            l.pop_front();
        }
        l.push_back(item);
    }

    /// Removes and returns the buffered items, oldest first.
    pub fn snapshot(&self) -> VecDeque<T> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
