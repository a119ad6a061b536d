use super::{
    RemoteStore, SERVER_TIMESTAMP_FIELD, SUMMARY_TIMESTAMP_FIELD, SummaryRecord, TrialBatch,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store. Keeps every committed batch in commit order.
#[derive(Default)]
pub struct MemoryStore {
    batches: RwLock<Vec<TrialBatch>>,
    summaries: RwLock<HashMap<String, JsonMap<String, JsonValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn committed_batches(&self) -> Vec<TrialBatch> {
        self.batches.read().await.clone()
    }

    /// Every stored record of one participant, in commit order.
    pub async fn records_for(&self, participant_id: &str) -> Vec<JsonMap<String, JsonValue>> {
        self.batches
            .read()
            .await
            .iter()
            .filter(|batch| batch.participant_id == participant_id)
            .flat_map(|batch| batch.records.iter().cloned())
            .collect()
    }

    pub async fn summary(&self, participant_id: &str) -> Option<JsonMap<String, JsonValue>> {
        self.summaries.read().await.get(participant_id).cloned()
    }

    pub async fn summary_count(&self) -> usize {
        self.summaries.read().await.len()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError> {
        let stamp = JsonValue::String(Utc::now().to_rfc3339());
        let mut stored = batch.clone();
        for record in &mut stored.records {
            record.insert(SERVER_TIMESTAMP_FIELD.to_string(), stamp.clone());
        }
        self.batches.write().await.push(stored);
        Ok(())
    }

    async fn merge_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError> {
        let mut summaries = self.summaries.write().await;
        let entry = summaries
            .entry(summary.participant_id.clone())
            .or_default();
        entry.extend(summary.merge_fields());
        entry.insert(
            SUMMARY_TIMESTAMP_FIELD.to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        Ok(())
    }
}
