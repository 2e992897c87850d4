//! The two long-lived loops that keep the catalogue current.
//!
//! The ingest loop scans the media root and records first probes. The
//! enrichment loop evaluates unchecked thumbnails and asks the improver for
//! more candidates. Both share one dispatcher and open their own catalogue
//! connection.

pub mod improver;
pub mod ingest;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::db::Catalogue;
use crate::error::is_storage_locked;
use crate::faces::{Evaluator, FaceScorer};
use crate::media::MediaDecoder;
use crate::scanner::Scanner;
use crate::tasks::{Dispatcher, Shutdown};

pub use improver::{improve_round, ImproveSummary};
pub use ingest::{ingest_pass, IngestSummary};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Sleep for `duration` in short slices. Returns false if `shutdown` was
/// raised before the time was up.
pub fn sleep_interruptible(duration: Duration, shutdown: &Shutdown) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if shutdown.is_triggered() {
            return false;
        }
        let step = remaining.min(SLEEP_SLICE);
        thread::sleep(step);
        remaining -= step;
    }
    !shutdown.is_triggered()
}

/// Uniformly random duration in `[0, max]`.
pub fn random_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run `op`, sleeping a random `0..=max_wait` and retrying while SQLite
/// reports the database as locked. Other errors return at once, as does the
/// locked error itself once `shutdown` is raised.
pub fn with_locked_retry<T>(
    shutdown: &Shutdown,
    max_wait: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    loop {
        match op() {
            Err(e) if is_storage_locked(&e) => {
                let delay = random_delay(max_wait);
                tracing::warn!(delay_ms = delay.as_millis() as u64, "Catalogue locked, retrying");
                if !sleep_interruptible(delay, shutdown) {
                    return Err(e);
                }
            }
            other => return other,
        }
    }
}

/// Shared state for the ingest and enrichment loops.
pub struct Pipeline {
    config: Config,
    decoder: Arc<dyn MediaDecoder>,
    scorer: Option<Arc<dyn FaceScorer>>,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
}

impl Pipeline {
    /// Start the probe workers. Without a scorer the enrichment loop is not
    /// run and files stay at their first thumbnail.
    pub fn new(
        config: Config,
        decoder: Arc<dyn MediaDecoder>,
        scorer: Option<Arc<dyn FaceScorer>>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.dispatch.workers, Arc::clone(&decoder))?;
        Ok(Self {
            config,
            decoder,
            scorer,
            dispatcher,
            shutdown,
        })
    }

    fn locked_retry_max(&self) -> Duration {
        Duration::from_secs(self.config.improver.locked_retry_max_secs)
    }

    fn keep(&self) -> usize {
        self.config.improver.keep_thumbnails as usize
    }

    pub fn open_catalogue(&self) -> Result<Catalogue> {
        Catalogue::open(&self.config.resolved_db_path())
    }

    /// Create the schema and bring stored scores up to date.
    pub fn prepare(&self) -> Result<()> {
        let mut db = self.open_catalogue()?;
        with_locked_retry(&self.shutdown, self.locked_retry_max(), || {
            db.init()?;
            db.rescore_all()
        })?;
        tracing::info!(db = %self.config.resolved_db_path().display(), "Catalogue ready");
        Ok(())
    }

    /// Scan, ingest and tidy every `rescan_interval_secs` until shutdown, or
    /// once when `once` is set or the interval is zero.
    pub fn ingest_loop(&self, once: bool) -> Result<()> {
        let mut db = self.open_catalogue()?;
        let root = std::fs::canonicalize(&self.config.media_path).with_context(|| {
            format!("Media root {} is not accessible", self.config.media_path.display())
        })?;
        let scanner = Scanner::new(root, self.config.ignore_names());
        let interval = Duration::from_secs(self.config.scanner.rescan_interval_secs);

        loop {
            ingest_pass(
                &mut db,
                &scanner,
                &self.dispatcher,
                self.decoder.as_ref(),
                self.keep(),
                self.locked_retry_max(),
                &self.shutdown,
            )?;

            if once || interval.is_zero() || !sleep_interruptible(interval, &self.shutdown) {
                return Ok(());
            }
        }
    }

    /// Evaluate, improve, evaluate, then idle a random while. Repeats until
    /// shutdown, or runs a single round when `once` is set.
    pub fn enrichment_loop(&self, once: bool) -> Result<()> {
        let Some(scorer) = &self.scorer else {
            tracing::info!("No face scorer available, enrichment disabled");
            return Ok(());
        };
        let mut db = self.open_catalogue()?;
        let evaluator = Evaluator::new(Arc::clone(scorer), self.keep());
        let idle_max = Duration::from_secs(self.config.improver.idle_max_secs);

        loop {
            with_locked_retry(&self.shutdown, self.locked_retry_max(), || {
                evaluator.run(&mut db, self.shutdown.flag())
            })?;
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            improve_round(
                &mut db,
                &self.dispatcher,
                &self.config.improver,
                &self.shutdown,
            )?;

            with_locked_retry(&self.shutdown, self.locked_retry_max(), || {
                evaluator.run(&mut db, self.shutdown.flag())
            })?;

            if once || !sleep_interruptible(random_delay(idle_max), &self.shutdown) {
                return Ok(());
            }
        }
    }

    /// Run both loops to completion. With `once` they run back to back so the
    /// enrichment round sees this pass's files; otherwise side by side. A
    /// failing loop is logged and the other keeps going; the first error is
    /// returned after both have stopped.
    pub fn run(&self, once: bool) -> Result<()> {
        self.prepare()?;

        let result = if once {
            self.ingest_loop(true)
                .and_then(|_| self.enrichment_loop(true))
        } else {
            thread::scope(|scope| {
                let ingest = scope.spawn(|| self.ingest_loop(false));
                let enrich = scope.spawn(|| self.enrichment_loop(false));
                let ingest = join_loop("ingest", ingest.join());
                let enrich = join_loop("enrichment", enrich.join());
                ingest.and(enrich)
            })
        };

        self.dispatcher.shutdown();
        result
    }
}

fn join_loop(name: &str, joined: thread::Result<Result<()>>) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            tracing::info!(loop_name = name, "Loop stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(loop_name = name, error = %format!("{:#}", e), "Loop failed");
            Err(e)
        }
        Err(_) => Err(anyhow!("{} loop panicked", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn locked_error() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
        .into()
    }

    #[test]
    fn test_locked_retry_retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = with_locked_retry(&Shutdown::new(), Duration::from_millis(5), || {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(locked_error())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_locked_retry_passes_other_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_locked_retry(&Shutdown::new(), Duration::from_millis(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk on fire")
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interruptible_sleep() {
        let shutdown = Shutdown::new();
        assert!(sleep_interruptible(Duration::from_millis(10), &shutdown));

        shutdown.trigger();
        let start = Instant::now();
        assert!(!sleep_interruptible(Duration::from_secs(30), &shutdown));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_random_delay_bounds() {
        assert_eq!(random_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(random_delay(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }
}
