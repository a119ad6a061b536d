//! Background executor for acknowledged submissions.
//!
//! Handlers hand jobs over with [`ReplicationQueue::submit`], which never
//! waits. A dispatcher task pulls a job from the bounded channel only when
//! one of the `max_in_flight` run slots is free, so at most
//! `capacity + max_in_flight` jobs are held at once. On shutdown the
//! queue drains for a bounded time and then abandons what is left; the
//! staging files of abandoned jobs stay on disk for replay.

use crate::pipeline::ReplicationPipeline;
use crate::replicator::ReplicationJob;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub completed: usize,
    pub abandoned: usize,
}

pub struct ReplicationQueue {
    sender: mpsc::Sender<ReplicationJob>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<usize>>>,
    pending: Arc<AtomicUsize>,
}

impl ReplicationQueue {
    /// Spawns the dispatcher. Must be called from within a Tokio runtime.
    pub fn start(
        pipeline: Arc<ReplicationPipeline>,
        capacity: usize,
        max_in_flight: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let dispatcher = tokio::spawn(dispatch(
            receiver,
            stop_rx,
            pipeline,
            Arc::new(Semaphore::new(max_in_flight.max(1))),
            pending.clone(),
        ));

        Self {
            sender,
            stop_tx: Mutex::new(Some(stop_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            pending,
        }
    }

    /// Hands a job to the background. Returns `false` when the job could not
    /// be queued; its staging file is then the only copy.
    #[must_use]
    pub fn submit(&self, job: ReplicationJob) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                error!(
                    job_id = %job.id,
                    participant_id = %job.submission.participant_id,
                    staging_path = %job.staging_path.display(),
                    "replication queue full; submission kept in local staging only"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                error!(
                    job_id = %job.id,
                    participant_id = %job.submission.participant_id,
                    staging_path = %job.staging_path.display(),
                    "replication queue closed; submission kept in local staging only"
                );
                false
            }
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stops accepting jobs, drains queued and running ones for at most
    /// `drain_timeout`, then aborts the rest.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        if let Some(stop_tx) = self.stop_tx.lock().ok().and_then(|mut guard| guard.take()) {
            let _ = stop_tx.send(());
        }

        let Some(mut dispatcher) = self.dispatcher.lock().ok().and_then(|mut guard| guard.take())
        else {
            return ShutdownReport {
                completed: 0,
                abandoned: self.pending(),
            };
        };

        match timeout(drain_timeout, &mut dispatcher).await {
            Ok(Ok(completed)) => {
                info!(completed, "replication queue drained");
                ShutdownReport {
                    completed,
                    abandoned: 0,
                }
            }
            Ok(Err(err)) => {
                error!(error = %err, "replication dispatcher failed");
                ShutdownReport {
                    completed: 0,
                    abandoned: self.pending(),
                }
            }
            Err(_) => {
                dispatcher.abort();
                let abandoned = self.pending();
                warn!(
                    abandoned,
                    drain_secs = drain_timeout.as_secs_f64(),
                    "replication drain timed out; abandoned jobs must be replayed from local staging"
                );
                ShutdownReport {
                    completed: 0,
                    abandoned,
                }
            }
        }
    }
}

impl Drop for ReplicationQueue {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.get_mut().ok().and_then(Option::take) {
            let _ = stop_tx.send(());
        }
        if let Some(dispatcher) = self.dispatcher.get_mut().ok().and_then(Option::take) {
            dispatcher.abort();
        }
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<ReplicationJob>,
    mut stop_rx: oneshot::Receiver<()>,
    pipeline: Arc<ReplicationPipeline>,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
) -> usize {
    let mut running = JoinSet::new();
    let mut completed = 0usize;

    // A job leaves the channel only once a run slot is free, so the channel
    // is what fills up when the store falls behind.
    loop {
        let permit = tokio::select! {
            _ = &mut stop_rx => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                completed += 1;
                log_join_error(joined);
                continue;
            }
        };

        let job = tokio::select! {
            _ = &mut stop_rx => break,
            job = receiver.recv() => job,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                completed += 1;
                log_join_error(joined);
                continue;
            }
        };

        match job {
            Some(job) => spawn_job(&mut running, job, permit, &pipeline, &pending),
            None => break,
        }
    }

    // Jobs accepted before the channel closed still run.
    receiver.close();
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        spawn_job(&mut running, job, permit, &pipeline, &pending);
    }
    while let Some(joined) = running.join_next().await {
        completed += 1;
        log_join_error(joined);
    }

    completed
}

fn spawn_job(
    running: &mut JoinSet<()>,
    job: ReplicationJob,
    permit: OwnedSemaphorePermit,
    pipeline: &Arc<ReplicationPipeline>,
    pending: &Arc<AtomicUsize>,
) {
    let pipeline = pipeline.clone();
    let pending = pending.clone();
    debug!(job_id = %job.id, participant_id = %job.submission.participant_id, "dispatching replication job");

    running.spawn(async move {
        pipeline.run(&job).await;
        pending.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    });
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "replication job task failed");
    }
}
