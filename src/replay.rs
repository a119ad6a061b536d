//! Re-runs replication from local staging files.
//!
//! Staging files are the recovery source for anything the background queue
//! failed or abandoned. Remote record ids are derived from the staging file
//! name, so replaying a file rewrites the same records.

use crate::error::SubmissionError;
use crate::pipeline::{JobOutcome, ReplicationPipeline};
use crate::replicator::ReplicationJob;
use crate::staging::kind_from_file_name;
use crate::submission::Submission;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read staging file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("'{0}' is not a staging file (expected trial_<ts>.json or final_<ts>.json)")]
    UnknownKind(PathBuf),
    #[error("staging file '{path}' does not hold a valid submission: {source}")]
    Invalid {
        path: PathBuf,
        source: SubmissionError,
    },
}

/// Rebuilds the replication job a staging file was written for.
pub async fn load_staged_job(path: &Path) -> Result<ReplicationJob, ReplayError> {
    let kind = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(kind_from_file_name)
        .ok_or_else(|| ReplayError::UnknownKind(path.to_path_buf()))?;

    let payload = fs::read(path).await.map_err(|source| ReplayError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let submission =
        Submission::from_body(kind, &payload).map_err(|source| ReplayError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(ReplicationJob::new(submission, path.to_path_buf()))
}

/// Loads and replicates one staging file in the foreground.
pub async fn replay_staging_file(
    pipeline: &ReplicationPipeline,
    path: &Path,
) -> Result<JobOutcome, ReplayError> {
    let job = load_staged_job(path).await?;
    Ok(pipeline.run(&job).await)
}
