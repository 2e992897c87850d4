use anyhow::Result;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use super::with_locked_retry;
use crate::db::Catalogue;
use crate::error::ProbeError;
use crate::media::tags::disk_tags;
use crate::media::MediaDecoder;
use crate::scanner::Scanner;
use crate::tasks::{Dispatcher, ProbeReply, ProbeRequest, Shutdown};

/// What one ingest pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub found: usize,
    pub submitted: usize,
    pub media: usize,
    pub not_media: usize,
    pub missing: usize,
    pub failed: usize,
    pub words: usize,
    pub renamed_tags: usize,
    pub culled: usize,
}

/// Scan, probe every new or changed file, record the replies, then run the
/// catalogue housekeeping: word associations, tag key normalisation, missing
/// file cull and a WAL truncate.
pub fn ingest_pass(
    db: &mut Catalogue,
    scanner: &Scanner,
    dispatcher: &Dispatcher,
    decoder: &dyn MediaDecoder,
    keep: usize,
    locked_retry_max: Duration,
    shutdown: &Shutdown,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();

    let scan = with_locked_retry(shutdown, locked_retry_max, || scanner.scan(db))?;
    summary.found = scan.total_found;

    let sizes: HashMap<PathBuf, u64> = scan
        .work
        .iter()
        .map(|f| (f.path.clone(), f.size))
        .collect();
    let requests: Vec<ProbeRequest> = scan
        .work
        .into_iter()
        .map(|f| ProbeRequest::first(f.path))
        .collect();

    let submitted = dispatcher.run_batch(requests, shutdown.flag(), |reply| {
        let size = sizes.get(&reply.request.path).copied().unwrap_or(0);
        record_reply(db, decoder, reply, size, keep, locked_retry_max, shutdown, &mut summary)
    })?;
    summary.submitted = submitted;

    if shutdown.is_triggered() {
        return Ok(summary);
    }

    summary.words = with_locked_retry(shutdown, locked_retry_max, || db.derive_word_associations())?;
    summary.renamed_tags = with_locked_retry(shutdown, locked_retry_max, || db.normalise_tag_keys())?;
    summary.culled = with_locked_retry(shutdown, locked_retry_max, || db.cull_missing())?;
    with_locked_retry(shutdown, locked_retry_max, || db.truncate_wal())?;

    tracing::info!(
        found = summary.found,
        submitted = summary.submitted,
        media = summary.media,
        not_media = summary.not_media,
        missing = summary.missing,
        failed = summary.failed,
        culled = summary.culled,
        "Ingest pass finished"
    );
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
fn record_reply(
    db: &mut Catalogue,
    decoder: &dyn MediaDecoder,
    reply: ProbeReply,
    size: u64,
    keep: usize,
    locked_retry_max: Duration,
    shutdown: &Shutdown,
    summary: &mut IngestSummary,
) -> Result<()> {
    let path = reply.request.path;

    let mut info = match reply.result {
        Ok(info) => info,
        Err(ProbeError::Missing) => {
            tracing::debug!(path = %path.display(), "File vanished before probing");
            summary.missing += 1;
            return Ok(());
        }
        Err(ProbeError::NotMedia) => {
            summary.not_media += 1;
            return with_locked_retry(shutdown, locked_retry_max, || {
                db.record_ingest(&path, size, None, keep)
            });
        }
        Err(e) if e.is_fatal() => {
            return Err(anyhow::Error::new(e).context(format!("Probing {}", path.display())));
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Probe failed, recording file only");
            summary.failed += 1;
            return with_locked_retry(shutdown, locked_retry_max, || {
                db.record_ingest(&path, size, None, keep)
            });
        }
    };

    for failure in &info.failures {
        tracing::warn!(path = %path.display(), error = %failure, "Thumbnail attempt failed");
    }
    if info.thumbnails.is_empty() {
        match decoder.fallback_test_pattern() {
            Ok(pattern) => info.thumbnails.push(pattern),
            Err(e) => tracing::warn!(error = %e, "Cannot build test pattern"),
        }
    }

    match std::fs::metadata(&path) {
        Ok(metadata) => info.tags.extend(disk_tags(&path, &metadata)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "File vanished after probing");
            summary.missing += 1;
            return Ok(());
        }
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot stat file"),
    }

    with_locked_retry(shutdown, locked_retry_max, || {
        db.record_ingest(&path, size, Some(&info), keep)
    })?;
    summary.media += 1;
    tracing::debug!(
        path = %path.display(),
        media_type = info.media_type.as_str(),
        thumbnails = info.thumbnails.len(),
        can_seek = info.can_seek,
        "Ingested"
    );
    Ok(())
}
