//! Batched remote replication of staged submissions.

use crate::store::{RemoteStore, TrialBatch};
use crate::submission::{Submission, TrialRecord};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Largest write set a remote store accepts in one atomic call.
pub const MAX_BATCH_SIZE: usize = 500;

/// What happens to the remaining chunks after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkFailurePolicy {
    /// Attempt every chunk; failures are only logged.
    #[default]
    Continue,
    /// Stop at the first failed chunk; the rest are reported as skipped.
    Halt,
}

impl FromStr for ChunkFailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "halt" => Ok(Self::Halt),
            other => Err(format!(
                "unknown chunk failure policy '{other}' (expected continue or halt)"
            )),
        }
    }
}

/// A staged submission waiting to be replicated.
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub id: Uuid,
    pub submission: Submission,
    /// Recovery source if anything below fails.
    pub staging_path: PathBuf,
}

impl ReplicationJob {
    pub fn new(submission: Submission, staging_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission,
            staging_path,
        }
    }

    /// File stem of the staging file, used to derive remote record ids.
    pub fn source(&self) -> String {
        self.staging_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.simple().to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub batches_skipped: usize,
    pub trials_written: usize,
    pub trials_skipped: usize,
}

impl ReplicationReport {
    /// True when every planned chunk reached the remote store.
    pub fn is_complete(&self) -> bool {
        self.batches_failed == 0 && self.batches_skipped == 0
    }
}

/// Splits records into chunks of at most `batch_size`, keeping input order.
pub fn plan_batches(records: Vec<TrialRecord>, batch_size: usize) -> Vec<Vec<TrialRecord>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        batches.push(records.by_ref().take(batch_size).collect());
    }
    batches
}

pub struct Replicator {
    store: Arc<dyn RemoteStore>,
    batch_size: usize,
    policy: ChunkFailurePolicy,
}

impl Replicator {
    pub fn new(store: Arc<dyn RemoteStore>, batch_size: usize, policy: ChunkFailurePolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Commits the job's trials chunk by chunk. Each chunk is awaited before
    /// the next one starts; nothing is retried.
    pub async fn replicate(&self, job: &ReplicationJob) -> ReplicationReport {
        let submission = &job.submission;
        let prepared = submission.prepare_trials();
        let mut report = ReplicationReport {
            trials_skipped: prepared.skipped,
            ..ReplicationReport::default()
        };

        if prepared.skipped > 0 {
            warn!(
                job_id = %job.id,
                participant_id = %submission.participant_id,
                skipped = prepared.skipped,
                "skipping trial items that are not JSON objects"
            );
        }

        let batches = plan_batches(prepared.records, self.batch_size);
        let total = batches.len();
        info!(
            job_id = %job.id,
            participant_id = %submission.participant_id,
            kind = %submission.kind,
            store = self.store.name(),
            batches = total,
            "replicating"
        );

        let source = job.source();
        let mut position = 0;
        for (chunk_index, records) in batches.into_iter().enumerate() {
            let batch = TrialBatch {
                kind: submission.kind,
                participant_id: submission.participant_id.clone(),
                source: source.clone(),
                chunk_index,
                first_position: position,
                records,
            };
            position += batch.records.len();

            match self.store.commit_batch(&batch).await {
                Ok(()) => {
                    report.batches_committed += 1;
                    report.trials_written += batch.records.len();
                    debug!(
                        job_id = %job.id,
                        participant_id = %batch.participant_id,
                        chunk_index,
                        size = batch.records.len(),
                        "committed batch {}/{}",
                        chunk_index + 1,
                        total
                    );
                }
                Err(err) => {
                    report.batches_failed += 1;
                    error!(
                        job_id = %job.id,
                        participant_id = %batch.participant_id,
                        chunk_index,
                        size = batch.records.len(),
                        staging_path = %job.staging_path.display(),
                        error = %err,
                        "batch commit failed; replay from the staging file to recover"
                    );
                    if self.policy == ChunkFailurePolicy::Halt {
                        report.batches_skipped = total - chunk_index - 1;
                        break;
                    }
                }
            }
        }

        if report.is_complete() {
            info!(
                job_id = %job.id,
                participant_id = %submission.participant_id,
                batches = report.batches_committed,
                trials = report.trials_written,
                "replicated"
            );
        } else {
            warn!(
                job_id = %job.id,
                participant_id = %submission.participant_id,
                committed = report.batches_committed,
                failed = report.batches_failed,
                skipped = report.batches_skipped,
                staging_path = %job.staging_path.display(),
                "replication-failed"
            );
        }

        report
    }
}
