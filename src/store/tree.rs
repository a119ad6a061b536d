//! Tree-store backend speaking the Realtime Database REST API.
//!
//! A multi-child `PATCH` is applied atomically, so each chunk is one request.
//! `PATCH` is also a native shallow merge, which gives the summary its upsert
//! semantics.

use super::{
    RemoteStore, SERVER_TIMESTAMP_FIELD, SUMMARY_TIMESTAMP_FIELD, SummaryRecord, TrialBatch,
    authorize, ensure_success, layout, FINAL_COLLECTION,
};
use crate::config::AccessToken;
use crate::error::StoreError;
use crate::escape::escape_with;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Map as JsonMap, Value as JsonValue, json};

pub struct TreeStore {
    client: reqwest::Client,
    database_url: Url,
    access_token: Option<AccessToken>,
}

impl TreeStore {
    pub fn new(
        client: reqwest::Client,
        database_url: &str,
        access_token: Option<AccessToken>,
    ) -> Result<Self, StoreError> {
        let database_url = Url::parse(database_url)
            .map_err(|err| StoreError::config(format!("invalid database URL: {err}")))?;
        if database_url.cannot_be_a_base() {
            return Err(StoreError::config("database URL cannot be used as a base"));
        }
        Ok(Self {
            client,
            database_url,
            access_token,
        })
    }

    /// REST URL of a node; the last segment gets the `.json` suffix.
    pub fn node_url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.database_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::config("database URL cannot be used as a base"))?;
            path.pop_if_empty();
            if let Some((last, parents)) = segments.split_last() {
                path.extend(parents.iter().copied());
                path.push(&format!("{last}.json"));
            }
        }
        Ok(url)
    }

    /// Children written by one chunk, keyed by record id.
    pub fn batch_patch_body(batch: &TrialBatch) -> JsonValue {
        let children: JsonMap<String, JsonValue> = batch
            .records
            .iter()
            .zip(batch.record_ids())
            .map(|(record, id)| {
                let mut record = record.clone();
                record.insert(SERVER_TIMESTAMP_FIELD.to_string(), server_time());
                (tree_key(&id), JsonValue::Object(record))
            })
            .collect();
        JsonValue::Object(children)
    }

    pub fn summary_patch_body(summary: &SummaryRecord) -> JsonValue {
        let mut fields = summary.merge_fields();
        fields.insert(SUMMARY_TIMESTAMP_FIELD.to_string(), server_time());
        JsonValue::Object(fields)
    }

    async fn patch(&self, url: Url, body: &JsonValue) -> Result<(), StoreError> {
        let request = authorize(self.client.patch(url), self.access_token.as_ref());
        let response = request.json(body).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for TreeStore {
    fn name(&self) -> &'static str {
        "tree"
    }

    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError> {
        let (collection, subcollection) = layout(batch.kind);
        let participant = tree_key(&batch.participant_id);
        let url = self.node_url(&[collection, &participant, subcollection])?;
        self.patch(url, &Self::batch_patch_body(batch)).await
    }

    async fn merge_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError> {
        let participant = tree_key(&summary.participant_id);
        let url = self.node_url(&[FINAL_COLLECTION, &participant])?;
        self.patch(url, &Self::summary_patch_body(summary)).await
    }
}

fn server_time() -> JsonValue {
    json!({ ".sv": "timestamp" })
}

/// Keys may not contain `.`, `$`, `#`, `[`, `]`, `/` or control characters.
/// Those are percent-escaped, so distinct ids stay distinct keys.
pub fn tree_key(raw: &str) -> String {
    escape_with(raw, |ch| matches!(ch, '.' | '$' | '#' | '[' | ']' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::SubmissionKind;

    #[test]
    fn keys_drop_reserved_characters() {
        assert_eq!(tree_key("P1"), "P1");
        assert_eq!(tree_key("a.b/c#d$e[f]"), "a%2Eb%2Fc%23d%24e%5Bf%5D");
        assert_ne!(tree_key("a.b"), tree_key("a_b"));
        assert_ne!(tree_key("a.b"), tree_key("a%2Eb"));
    }

    #[test]
    fn node_urls_escape_segments_and_append_json_suffix() {
        let store = TreeStore::new(
            reqwest::Client::new(),
            "https://lab-default-rtdb.firebaseio.com/",
            None,
        )
        .unwrap();
        let url = store
            .node_url(&["participants_finished", "P 1", "final_trials"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://lab-default-rtdb.firebaseio.com/participants_finished/P%201/final_trials.json"
        );
    }

    #[test]
    fn batch_body_stamps_server_time_on_every_child() {
        let mut record = JsonMap::new();
        record.insert("rt".to_string(), json!(250));
        let batch = TrialBatch {
            kind: SubmissionKind::Final,
            participant_id: "P1".to_string(),
            source: "final_9".to_string(),
            chunk_index: 0,
            first_position: 3,
            records: vec![record],
        };
        let body = TreeStore::batch_patch_body(&batch);
        assert_eq!(
            body,
            json!({ "final_9_000003": { "rt": 250, "server_timestamp": { ".sv": "timestamp" } } })
        );
    }
}
