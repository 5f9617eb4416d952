//! Unique job processor — a bounded-concurrency FIFO queue deduplicated by
//! job id.
//!
//! The processor is a single-owner loop: submissions, internal finish
//! notifications, and pool-size updates each arrive on their own channel, so
//! the queue and the in-flight set need no locks. While a job with a given
//! id is queued or executing, further submissions of that id are dropped,
//! which is what keeps a burst of reconcile passes from stacking duplicate
//! builds for one app.
//!
//! All channels are capacity-1. Consumers MUST drain the public finish
//! channel or the processor stalls; that backpressure is deliberate, it makes
//! missed events impossible.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use tokio::sync::mpsc;

/// Emitted on the public finish channel when a worker completes.
#[derive(Debug)]
pub struct JobFinishedEvent {
    pub id: String,
    pub result: Result<()>,
}

type BoxedJob = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct QueueItem {
    id: String,
    job: BoxedJob,
}

/// Cloneable handle for submitting jobs and resizing the worker pool.
#[derive(Clone)]
pub struct JobSubmitter {
    submit_tx: mpsc::Sender<QueueItem>,
    pool_tx: mpsc::Sender<usize>,
}

impl JobSubmitter {
    /// Submit a job keyed by `id`. Dropped silently if a job with the same
    /// id is already queued or executing.
    pub async fn submit<F>(&self, id: impl Into<String>, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let item = QueueItem {
            id: id.into(),
            job: Box::pin(job),
        };
        let _ = self.submit_tx.send(item).await;
    }

    /// Resize the worker pool. Takes effect on the processor's next event.
    pub async fn set_pool_size(&self, size: usize) {
        let _ = self.pool_tx.send(size).await;
    }
}

/// The processor loop state. Obtain one via [`unique_job_processor`] and
/// drive it with [`UniqueJobProcessor::run`].
pub struct UniqueJobProcessor {
    pool_size: usize,
    queue: VecDeque<QueueItem>,
    in_flight: HashSet<String>,
    submit_rx: mpsc::Receiver<QueueItem>,
    pool_rx: mpsc::Receiver<usize>,
    internal_tx: mpsc::Sender<JobFinishedEvent>,
    internal_rx: mpsc::Receiver<JobFinishedEvent>,
    public_tx: mpsc::Sender<JobFinishedEvent>,
}

/// Build a processor with the given worker pool size.
///
/// Returns the processor itself, a submission handle, and the public finish
/// channel, which the caller must keep draining.
pub fn unique_job_processor(
    pool_size: usize,
) -> (
    UniqueJobProcessor,
    JobSubmitter,
    mpsc::Receiver<JobFinishedEvent>,
) {
    let (submit_tx, submit_rx) = mpsc::channel(1);
    let (pool_tx, pool_rx) = mpsc::channel(1);
    let (internal_tx, internal_rx) = mpsc::channel(1);
    let (public_tx, public_rx) = mpsc::channel(1);

    let processor = UniqueJobProcessor {
        pool_size,
        queue: VecDeque::new(),
        in_flight: HashSet::new(),
        submit_rx,
        pool_rx,
        internal_tx,
        internal_rx,
        public_tx,
    };
    let submitter = JobSubmitter { submit_tx, pool_tx };
    (processor, submitter, public_rx)
}

impl UniqueJobProcessor {
    /// Run the processor loop. Runs for the life of the process.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(item) = self.submit_rx.recv() => {
                    if self.is_pending(&item.id) {
                        tracing::debug!(id = %item.id, "job already pending, dropping duplicate");
                    } else {
                        self.queue.push_back(item);
                        self.pump();
                    }
                }
                Some(event) = self.internal_rx.recv() => {
                    self.in_flight.remove(&event.id);
                    self.pump();
                    // Forwarded only after the slot is released, so a consumer
                    // that observes the finish can immediately resubmit the id.
                    // Blocks until the consumer drains it; that is the
                    // documented backpressure.
                    let _ = self.public_tx.send(event).await;
                }
                Some(size) = self.pool_rx.recv() => {
                    tracing::debug!(size, "worker pool resized");
                    self.pool_size = size;
                }
                else => break,
            }
        }
    }

    /// A job id counts as pending while it is queued or executing.
    fn is_pending(&self, id: &str) -> bool {
        self.in_flight.contains(id) || self.queue.iter().any(|item| item.id == id)
    }

    /// Dispatch queued jobs into free worker slots, FIFO.
    fn pump(&mut self) {
        while self.in_flight.len() < self.pool_size {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.in_flight.insert(item.id.clone());

            let internal_tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = item.job.await;
                let _ = internal_tx
                    .send(JobFinishedEvent { id: item.id, result })
                    .await;
            });
        }
    }
}
