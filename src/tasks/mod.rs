//! Probe work items and the worker pool that executes them.
//!
//! Requests travel to workers over a rendezvous channel, so submitting blocks
//! while every worker is busy. Each batch has its own reply channel, which
//! closes once the batch's submitter and every in-flight job are done.

pub mod dispatcher;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ProbeError;
use crate::media::MediaInfo;

pub use dispatcher::{BatchSubmitter, Dispatcher};

/// Position used for a file's first thumbnail.
pub const FIRST_PROBE_POSITION: f64 = 0.5;

/// A file to probe and where to take thumbnails from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub path: PathBuf,
    /// One entry per thumbnail, each a fraction of the duration.
    pub positions: Vec<f64>,
    pub want_seek: bool,
}

impl ProbeRequest {
    /// First-time ingest: a single mid-point probe.
    pub fn first(path: PathBuf) -> Self {
        Self {
            path,
            positions: vec![FIRST_PROBE_POSITION],
            want_seek: true,
        }
    }

    /// Improver follow-up at random positions in (0, 1).
    pub fn random(path: PathBuf, count: usize) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let positions = (0..count.max(1))
            .map(|_| rng.gen_range(f64::EPSILON..1.0))
            .collect();
        Self {
            path,
            positions,
            want_seek: true,
        }
    }
}

/// What a worker sends back. Ordering relative to submission is not kept.
#[derive(Debug)]
pub struct ProbeReply {
    pub request: ProbeRequest,
    pub result: Result<MediaInfo, ProbeError>,
}

/// Cooperative stop signal shared by the long-lived loops.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }
}
