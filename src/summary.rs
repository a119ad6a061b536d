use crate::replicator::{ReplicationJob, ReplicationReport};
use crate::store::{RemoteStore, SummaryRecord, SummaryStatus};
use crate::submission::{Submission, SubmissionKind};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// Only final submissions carry a summary.
    NotApplicable,
    Recorded(SummaryRecord),
    Failed,
}

/// Merges the per-participant status record once replication has finished.
pub struct SummaryRecorder {
    store: Arc<dyn RemoteStore>,
}

impl SummaryRecorder {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub fn build(submission: &Submission, report: &ReplicationReport) -> SummaryRecord {
        let status = if report.is_complete() {
            SummaryStatus::Completed
        } else {
            SummaryStatus::Failed
        };
        SummaryRecord {
            participant_id: submission.participant_id.clone(),
            status,
            trials_saved: report.trials_written,
            recorded_at: Utc::now(),
            save_duration_ms: submission.save_duration_ms,
        }
    }

    /// Runs whatever the replication outcome was. Errors end up in the log
    /// only.
    pub async fn record(&self, job: &ReplicationJob, report: &ReplicationReport) -> SummaryOutcome {
        if job.submission.kind != SubmissionKind::Final {
            return SummaryOutcome::NotApplicable;
        }

        let summary = Self::build(&job.submission, report);
        match self.store.merge_summary(&summary).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    participant_id = %summary.participant_id,
                    status = summary.status.as_str(),
                    trials_saved = summary.trials_saved,
                    "summarized"
                );
                SummaryOutcome::Recorded(summary)
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    participant_id = %summary.participant_id,
                    staging_path = %job.staging_path.display(),
                    error = %err,
                    "failed to merge participant summary"
                );
                SummaryOutcome::Failed
            }
        }
    }
}
