use crate::replicator::{ReplicationJob, ReplicationReport, Replicator};
use crate::summary::{SummaryOutcome, SummaryRecorder};

/// Result of running one job through replication and summary.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub report: ReplicationReport,
    pub summary: SummaryOutcome,
}

/// Everything that happens to a submission after it was acknowledged.
pub struct ReplicationPipeline {
    replicator: Replicator,
    recorder: SummaryRecorder,
}

impl ReplicationPipeline {
    pub fn new(replicator: Replicator, recorder: SummaryRecorder) -> Self {
        Self {
            replicator,
            recorder,
        }
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Replicates, then summarizes. The summary step never depends on
    /// replication having succeeded.
    pub async fn run(&self, job: &ReplicationJob) -> JobOutcome {
        let report = self.replicator.replicate(job).await;
        let summary = self.recorder.record(job, &report).await;
        JobOutcome { report, summary }
    }
}
