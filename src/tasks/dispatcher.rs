use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::{ProbeReply, ProbeRequest};
use crate::media::MediaDecoder;

struct Job {
    request: ProbeRequest,
    reply_to: SyncSender<ProbeReply>,
}

/// Fixed pool of probe workers shared by the ingest and improver loops.
pub struct Dispatcher {
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl Dispatcher {
    pub fn new(size: usize, decoder: Arc<dyn MediaDecoder>) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(0);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let decoder = Arc::clone(&decoder);
            let handle = thread::Builder::new()
                .name(format!("probe-{}", id))
                .spawn(move || worker_loop(id, receiver, decoder))?;
            workers.push(handle);
        }
        tracing::info!(workers = size, "Probe workers started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Open a batch: a submitter plus the receiving end of its replies. The
    /// reply sequence ends once the submitter is dropped and every request it
    /// submitted has been answered.
    pub fn batch(&self) -> (BatchSubmitter<'_>, Receiver<ProbeReply>) {
        let (reply_to, replies) = mpsc::sync_channel(self.size);
        (
            BatchSubmitter {
                dispatcher: self,
                reply_to,
            },
            replies,
        )
    }

    /// Hand a request to the next free worker, blocking until one takes it.
    fn submit(&self, request: ProbeRequest, reply_to: SyncSender<ProbeReply>) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|e| anyhow!("Dispatcher lock poisoned: {}", e))?
            .clone()
            .ok_or_else(|| anyhow!("Dispatcher has been shut down"))?;
        sender
            .send(Job { request, reply_to })
            .map_err(|_| anyhow!("All probe workers have exited"))
    }

    /// Submit `requests` from a helper thread while feeding replies to
    /// `on_reply` on this one. Submission stops early when `shutdown` is
    /// raised or `on_reply` fails; replies already in flight are drained
    /// either way. Returns how many requests were submitted.
    pub fn run_batch<I, F>(&self, requests: I, shutdown: &AtomicBool, mut on_reply: F) -> Result<usize>
    where
        I: IntoIterator<Item = ProbeRequest>,
        I::IntoIter: Send,
        F: FnMut(ProbeReply) -> Result<()>,
    {
        let (submitter, replies) = self.batch();
        let requests = requests.into_iter();
        let abort = AtomicBool::new(false);

        thread::scope(|scope| {
            let abort = &abort;
            let feeder = scope.spawn(move || -> Result<usize> {
                let mut submitted = 0;
                for request in requests {
                    if shutdown.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
                        break;
                    }
                    submitter.submit(request)?;
                    submitted += 1;
                }
                Ok(submitted)
            });

            let mut outcome = Ok(());
            for reply in replies.iter() {
                if outcome.is_err() {
                    continue;
                }
                if let Err(e) = on_reply(reply) {
                    abort.store(true, Ordering::SeqCst);
                    outcome = Err(e);
                }
            }

            let submitted = feeder
                .join()
                .map_err(|_| anyhow!("Batch submitter panicked"))??;
            outcome.map(|_| submitted)
        })
    }

    /// Close the request channel and wait for every worker to exit.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("Probe worker panicked");
            }
        }
        tracing::info!("Probe workers stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Submitting half of a batch. Dropping it closes the batch.
pub struct BatchSubmitter<'a> {
    dispatcher: &'a Dispatcher,
    reply_to: SyncSender<ProbeReply>,
}

impl BatchSubmitter<'_> {
    pub fn submit(&self, request: ProbeRequest) -> Result<()> {
        self.dispatcher.submit(request, self.reply_to.clone())
    }
}

fn worker_loop(id: usize, receiver: Arc<Mutex<Receiver<Job>>>, decoder: Arc<dyn MediaDecoder>) {
    loop {
        let job = {
            let receiver = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receiver.recv()
        };
        let Ok(job) = job else {
            break;
        };

        tracing::debug!(worker = id, path = %job.request.path.display(), "Probing");
        let result = decoder.probe(&job.request.path, &job.request.positions, job.request.want_seek);
        let reply = ProbeReply {
            request: job.request,
            result,
        };
        if job.reply_to.send(reply).is_err() {
            tracing::debug!(worker = id, "Reply dropped, batch already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::media::{MediaInfo, MediaType};
    use std::collections::{BTreeMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Tracks how many probes run at once.
    struct CountingDecoder {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MediaDecoder for CountingDecoder {
        fn probe(&self, path: &Path, positions: &[f64], _want_seek: bool) -> Result<MediaInfo, ProbeError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);

            if path.extension().is_some_and(|e| e == "txt") {
                return Err(ProbeError::NotMedia);
            }
            Ok(MediaInfo {
                media_type: MediaType::Video,
                tags: BTreeMap::new(),
                thumbnails: Vec::new(),
                can_seek: true,
                probes: positions.len() as u32,
                failures: Vec::new(),
            })
        }
    }

    fn counting() -> Arc<CountingDecoder> {
        Arc::new(CountingDecoder {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn requests(n: usize) -> Vec<ProbeRequest> {
        (0..n)
            .map(|i| {
                let ext = if i % 3 == 0 { "txt" } else { "mp4" };
                ProbeRequest::first(PathBuf::from(format!("/m/{}.{}", i, ext)))
            })
            .collect()
    }

    #[test]
    fn test_every_request_gets_one_reply() {
        let decoder = counting();
        let dispatcher = Dispatcher::new(3, decoder.clone()).unwrap();

        let mut seen = HashSet::new();
        let mut not_media = 0;
        let submitted = dispatcher
            .run_batch(requests(12), &AtomicBool::new(false), |reply| {
                if matches!(reply.result, Err(ProbeError::NotMedia)) {
                    not_media += 1;
                }
                assert!(seen.insert(reply.request.path));
                Ok(())
            })
            .unwrap();

        assert_eq!(submitted, 12);
        assert_eq!(seen.len(), 12);
        assert_eq!(not_media, 4);
        assert!(decoder.peak.load(Ordering::SeqCst) <= 3);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_flag_stops_submission() {
        let dispatcher = Dispatcher::new(2, counting()).unwrap();
        let mut replies = 0;
        let submitted = dispatcher
            .run_batch(requests(5), &AtomicBool::new(true), |_| {
                replies += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(submitted, 0);
        assert_eq!(replies, 0);
    }

    #[test]
    fn test_handler_error_drains_and_propagates() {
        let dispatcher = Dispatcher::new(2, counting()).unwrap();
        let result = dispatcher.run_batch(requests(8), &AtomicBool::new(false), |_| {
            anyhow::bail!("storage failure")
        });
        assert!(result.is_err());

        // pool still usable afterwards
        let submitted = dispatcher
            .run_batch(requests(2), &AtomicBool::new(false), |_| Ok(()))
            .unwrap();
        assert_eq!(submitted, 2);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let dispatcher = Dispatcher::new(1, counting()).unwrap();
        dispatcher.shutdown();
        let (submitter, _replies) = dispatcher.batch();
        assert!(submitter.submit(ProbeRequest::first(PathBuf::from("/m/a"))).is_err());
    }
}
