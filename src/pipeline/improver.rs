use anyhow::Result;
use std::time::Duration;

use super::with_locked_retry;
use crate::config::ImproverConfig;
use crate::db::{Catalogue, ImproverSelection};
use crate::error::ProbeError;
use crate::tasks::{Dispatcher, ProbeReply, ProbeRequest, Shutdown};

/// Outcome of one improver round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImproveSummary {
    pub candidates: usize,
    pub probed: usize,
    pub thumbnails: usize,
    pub failed: usize,
}

impl From<&ImproverConfig> for ImproverSelection {
    fn from(config: &ImproverConfig) -> Self {
        ImproverSelection {
            min_probes: config.min_probes,
            max_probes: config.max_probes,
            target_score: config.target_score(),
        }
    }
}

/// Take one more thumbnail at a random position for every file that is
/// evaluated, seekable, under its probe budget and still below the target
/// score. Each reply marks its file unchecked so the evaluator picks it up.
pub fn improve_round(
    db: &mut Catalogue,
    dispatcher: &Dispatcher,
    config: &ImproverConfig,
    shutdown: &Shutdown,
) -> Result<ImproveSummary> {
    let locked_retry_max = Duration::from_secs(config.locked_retry_max_secs);
    let selection = ImproverSelection::from(config);

    let candidates = with_locked_retry(shutdown, locked_retry_max, || {
        db.improver_candidates(&selection)
    })?;
    let mut summary = ImproveSummary {
        candidates: candidates.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        return Ok(summary);
    }

    let requests: Vec<ProbeRequest> = candidates
        .into_iter()
        .map(|(path, _)| ProbeRequest::random(path, 1))
        .collect();

    dispatcher.run_batch(requests, shutdown.flag(), |reply| {
        record_reply(db, reply, locked_retry_max, shutdown, &mut summary)
    })?;

    tracing::info!(
        candidates = summary.candidates,
        probed = summary.probed,
        thumbnails = summary.thumbnails,
        failed = summary.failed,
        "Improver round finished"
    );
    Ok(summary)
}

fn record_reply(
    db: &mut Catalogue,
    reply: ProbeReply,
    locked_retry_max: Duration,
    shutdown: &Shutdown,
    summary: &mut ImproveSummary,
) -> Result<()> {
    let path = reply.request.path;

    let (thumbnails, can_seek) = match reply.result {
        Ok(info) => {
            for failure in &info.failures {
                tracing::debug!(path = %path.display(), error = %failure, "Extra thumbnail failed");
            }
            (info.thumbnails, info.can_seek)
        }
        Err(ProbeError::Missing) => {
            tracing::debug!(path = %path.display(), "File vanished, leaving it for the missing-file cull");
            return Ok(());
        }
        Err(e) if e.is_fatal() => {
            return Err(anyhow::Error::new(e).context(format!("Probing {}", path.display())));
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Extra probe failed");
            summary.failed += 1;
            (Vec::new(), true)
        }
    };

    let recorded = with_locked_retry(shutdown, locked_retry_max, || {
        db.record_probe(&path, &thumbnails, can_seek)
    })?;
    if recorded {
        summary.probed += 1;
        summary.thumbnails += thumbnails.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaDecoder, MediaInfo, MediaType, Thumbnail};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    /// Thumbnail bytes derived from the requested position.
    struct PositionDecoder;

    impl MediaDecoder for PositionDecoder {
        fn probe(&self, path: &Path, positions: &[f64], _want_seek: bool) -> Result<MediaInfo, ProbeError> {
            if path.ends_with("gone.mp4") {
                return Err(ProbeError::Missing);
            }
            if path.ends_with("denied.mp4") {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into());
            }
            Ok(MediaInfo {
                media_type: MediaType::Video,
                tags: BTreeMap::new(),
                thumbnails: positions
                    .iter()
                    .map(|p| Thumbnail::from_image(format!("{}:{}", path.display(), p).into_bytes()))
                    .collect(),
                can_seek: !path.ends_with("stream.ts"),
                probes: positions.len() as u32,
                failures: Vec::new(),
            })
        }
    }

    fn evaluated(db: &mut Catalogue, path: &str, can_seek: bool) {
        let info = MediaInfo {
            media_type: MediaType::Video,
            tags: BTreeMap::new(),
            thumbnails: vec![Thumbnail::from_image(path.as_bytes().to_vec())],
            can_seek,
            probes: 1,
            failures: Vec::new(),
        };
        db.record_ingest(Path::new(path), 1, Some(&info), 4).unwrap();
        db.finish_evaluation(Path::new(path), 4).unwrap();
    }

    #[test]
    fn test_round_probes_candidates_once() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        evaluated(&mut db, "/m/a.mp4", true);
        evaluated(&mut db, "/m/stream.ts", true);
        evaluated(&mut db, "/m/still.mp4", false);

        let dispatcher = Dispatcher::new(2, Arc::new(PositionDecoder)).unwrap();
        let config = ImproverConfig::default();
        let summary = improve_round(&mut db, &dispatcher, &config, &Shutdown::new()).unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.probed, 2);

        let a = db.media_file(Path::new("/m/a.mp4")).unwrap().unwrap();
        assert_eq!(a.probes, 2);
        assert!(!a.facechecked);
        assert!(a.canseek);
        assert_eq!(db.thumbnails_for(Path::new("/m/a.mp4")).unwrap().len(), 2);

        let stream = db.media_file(Path::new("/m/stream.ts")).unwrap().unwrap();
        assert!(!stream.canseek);

        let still = db.media_file(Path::new("/m/still.mp4")).unwrap().unwrap();
        assert_eq!(still.probes, 1);

        // nothing is evaluated now, so the next round has no work
        let again = improve_round(&mut db, &dispatcher, &config, &Shutdown::new()).unwrap();
        assert_eq!(again, ImproveSummary::default());
    }

    #[test]
    fn test_missing_file_is_not_counted() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        evaluated(&mut db, "/m/gone.mp4", true);

        let dispatcher = Dispatcher::new(1, Arc::new(PositionDecoder)).unwrap();
        let summary =
            improve_round(&mut db, &dispatcher, &ImproverConfig::default(), &Shutdown::new()).unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.probed, 0);
        let gone = db.media_file(Path::new("/m/gone.mp4")).unwrap().unwrap();
        assert_eq!(gone.probes, 1);
    }

    #[test]
    fn test_refused_read_ends_round() {
        let mut db = Catalogue::open_in_memory().unwrap();
        db.init().unwrap();
        evaluated(&mut db, "/m/denied.mp4", true);

        let dispatcher = Dispatcher::new(1, Arc::new(PositionDecoder)).unwrap();
        let err = improve_round(&mut db, &dispatcher, &ImproverConfig::default(), &Shutdown::new())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("denied.mp4"));

        let record = db.media_file(Path::new("/m/denied.mp4")).unwrap().unwrap();
        assert_eq!(record.probes, 1);
        assert!(record.facechecked);
    }
}
