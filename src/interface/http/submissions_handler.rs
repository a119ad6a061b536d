use axum::{Json, body::Bytes, extract::State};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    interface::http::problem::{ApiError, ApiResult},
    replicator::ReplicationJob,
    state::AppState,
    submission::{Submission, SubmissionKind},
};

pub const LIVENESS_MESSAGE: &str = "jsPsych backend is running.";

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn liveness() -> &'static str {
    LIVENESS_MESSAGE
}

pub async fn save_trial_data(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    accept_submission(&state, SubmissionKind::Trial, body).await
}

pub async fn save_final_data(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    accept_submission(&state, SubmissionKind::Final, body).await
}

/// Validate, stage, acknowledge. Replication is handed to the queue and never
/// awaited here.
async fn accept_submission(
    state: &AppState,
    kind: SubmissionKind,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    info!(%kind, bytes = body.len(), "received submission");

    let submission = Submission::from_body(kind, &body).map_err(|err| {
        warn!(%kind, error = %err, "rejected submission");
        ApiError::from(err)
    })?;

    let staging_path = state
        .staging
        .stage(kind, &submission.participant_id, &body)
        .await
        .map_err(|err| {
            error!(
                %kind,
                participant_id = %submission.participant_id,
                error = %err,
                "local staging failed; submission not acknowledged"
            );
            ApiError::from(err)
        })?;

    let message = match kind {
        SubmissionKind::Final => format!(
            "Final data for {} trials received and saved successfully.",
            submission.trials.len()
        ),
        SubmissionKind::Trial => "Trial data received and saved successfully.".to_string(),
    };

    info!(
        %kind,
        participant_id = %submission.participant_id,
        trials = submission.trials.len(),
        staging_path = %staging_path.display(),
        "acknowledged"
    );
    let participant_id = submission.participant_id.clone();
    if !state
        .queue
        .submit(ReplicationJob::new(submission, staging_path))
    {
        warn!(
            %kind,
            participant_id = %participant_id,
            "acknowledged without background replication; replay the staging file to replicate"
        );
    }

    Ok(Json(MessageResponse { message }))
}
