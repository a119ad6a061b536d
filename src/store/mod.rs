//! Remote durable stores that trials are replicated into.
//!
//! Every backend offers the same two operations: one atomic multi-record write
//! per chunk, and an upsert of the per-participant summary.

use crate::config::{AccessToken, RemoteBackend, RemoteConfig};
use crate::error::StoreError;
use crate::submission::{SubmissionKind, TrialRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;

pub mod blob;
pub mod document;
pub mod memory;
pub mod tree;

pub use blob::BlobStore;
pub use document::DocumentStore;
pub use memory::MemoryStore;
pub use tree::TreeStore;

/// Top-level collection holding final submissions and their summaries.
pub const FINAL_COLLECTION: &str = "participants_finished";
pub const FINAL_SUBCOLLECTION: &str = "final_trials";
pub const TRIAL_COLLECTION: &str = "participants_trials";
pub const TRIAL_SUBCOLLECTION: &str = "trials";

/// Field stamped on every replicated trial with the store's own clock.
pub const SERVER_TIMESTAMP_FIELD: &str = "server_timestamp";
/// Field stamped on the summary record with the store's own clock.
pub const SUMMARY_TIMESTAMP_FIELD: &str = "final_save_timestamp";

/// `(collection, subcollection)` a submission kind is written under.
pub fn layout(kind: SubmissionKind) -> (&'static str, &'static str) {
    match kind {
        SubmissionKind::Final => (FINAL_COLLECTION, FINAL_SUBCOLLECTION),
        SubmissionKind::Trial => (TRIAL_COLLECTION, TRIAL_SUBCOLLECTION),
    }
}

/// One chunk of trials written in a single atomic call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialBatch {
    pub kind: SubmissionKind,
    pub participant_id: String,
    /// Stem of the staging file the records came from.
    pub source: String,
    pub chunk_index: usize,
    /// Position of the first record of this chunk within the submission.
    pub first_position: usize,
    pub records: Vec<TrialRecord>,
}

impl TrialBatch {
    /// Deterministic record ids: replaying a staging file rewrites the same
    /// records instead of duplicating them.
    pub fn record_ids(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.records.len())
            .map(move |offset| format!("{}_{:06}", self.source, self.first_position + offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Completed,
    Failed,
}

impl SummaryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Per-participant status merged after replication.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub participant_id: String,
    pub status: SummaryStatus,
    pub trials_saved: usize,
    /// Local clock; stores that can assign their own time ignore it.
    pub recorded_at: DateTime<Utc>,
    pub save_duration_ms: Option<f64>,
}

impl SummaryRecord {
    /// Fields merged into the stored summary, excluding the timestamp.
    pub fn merge_fields(&self) -> JsonMap<String, JsonValue> {
        let mut fields = JsonMap::new();
        fields.insert(
            "subject_id".to_string(),
            JsonValue::String(self.participant_id.clone()),
        );
        fields.insert(
            "final_save_status".to_string(),
            JsonValue::String(self.status.as_str().to_string()),
        );
        fields.insert(
            "trials_saved".to_string(),
            JsonValue::from(self.trials_saved as u64),
        );
        if let Some(duration) = self.save_duration_ms {
            fields.insert("save_duration_ms".to_string(), JsonValue::from(duration));
        }
        fields
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Writes every record of `batch` atomically.
    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError>;

    /// Upserts the summary, overwriting only the fields it carries.
    async fn merge_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError>;
}

/// Backend used when replication is disabled: everything stays local.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl RemoteStore for NullStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError> {
        tracing::debug!(
            participant_id = %batch.participant_id,
            chunk_index = batch.chunk_index,
            records = batch.records.len(),
            "remote replication disabled; batch kept in local staging only"
        );
        Ok(())
    }

    async fn merge_summary(&self, _summary: &SummaryRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Builds the backend selected by configuration.
pub fn build_remote_store(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, StoreError> {
    let store: Arc<dyn RemoteStore> = match config.backend {
        RemoteBackend::None => Arc::new(NullStore),
        RemoteBackend::Memory => Arc::new(MemoryStore::new()),
        RemoteBackend::Document => {
            let project_id = config.firestore_project_id.clone().ok_or_else(|| {
                StoreError::config("FIRESTORE_PROJECT_ID is required for the document backend")
            })?;
            Arc::new(DocumentStore::new(
                http_client(config)?,
                &config.firestore_base_url,
                project_id,
                config.access_token.clone(),
            ))
        }
        RemoteBackend::Tree => {
            let database_url = config.database_url.as_deref().ok_or_else(|| {
                StoreError::config("FIREBASE_DATABASE_URL is required for the tree backend")
            })?;
            Arc::new(TreeStore::new(
                http_client(config)?,
                database_url,
                config.access_token.clone(),
            )?)
        }
        RemoteBackend::Blob => {
            let bucket = config.storage_bucket.clone().ok_or_else(|| {
                StoreError::config("STORAGE_BUCKET is required for the blob backend")
            })?;
            Arc::new(BlobStore::new(
                http_client(config)?,
                &config.storage_base_url,
                bucket,
                config.access_token.clone(),
            )?)
        }
    };
    Ok(store)
}

fn http_client(config: &RemoteConfig) -> Result<reqwest::Client, StoreError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|err| StoreError::config(format!("failed to build HTTP client: {err}")))
}

pub(crate) fn authorize(
    request: reqwest::RequestBuilder,
    token: Option<&AccessToken>,
) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.expose()),
        None => request,
    }
}

// Cap on how much of an error body ends up in a log line.
const ERROR_BODY_LIMIT: usize = 512;

/// Turns a non-2xx response into `StoreError::Status`.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_follow_submission_positions() {
        let batch = TrialBatch {
            kind: SubmissionKind::Final,
            participant_id: "P1".to_string(),
            source: "final_1700000000000".to_string(),
            chunk_index: 1,
            first_position: 500,
            records: vec![TrialRecord::new(), TrialRecord::new()],
        };
        let ids: Vec<_> = batch.record_ids().collect();
        assert_eq!(
            ids,
            vec!["final_1700000000000_000500", "final_1700000000000_000501"]
        );
    }

    #[test]
    fn summary_fields_include_duration_only_when_supplied() {
        let mut summary = SummaryRecord {
            participant_id: "P1".to_string(),
            status: SummaryStatus::Completed,
            trials_saved: 2,
            recorded_at: Utc::now(),
            save_duration_ms: None,
        };
        let fields = summary.merge_fields();
        assert_eq!(fields["final_save_status"], "completed");
        assert_eq!(fields["trials_saved"], 2);
        assert!(!fields.contains_key("save_duration_ms"));

        summary.save_duration_ms = Some(840.0);
        assert_eq!(summary.merge_fields()["save_duration_ms"], 840.0);
    }

    #[test]
    fn missing_backend_parameters_are_configuration_errors() {
        let config = RemoteConfig {
            backend: RemoteBackend::Document,
            ..RemoteConfig::default()
        };
        assert!(matches!(
            build_remote_store(&config),
            Err(StoreError::Config(_))
        ));

        let config = RemoteConfig {
            backend: RemoteBackend::Memory,
            ..RemoteConfig::default()
        };
        assert_eq!(build_remote_store(&config).unwrap().name(), "memory");
    }
}
