//! Document-store backend speaking the Firestore REST `commit` API.
//!
//! A chunk becomes one `documents:commit` call, which Firestore applies
//! atomically. The emulator accepts the same requests, so `FIRESTORE_BASE_URL`
//! may point at it.

use super::{
    RemoteStore, SERVER_TIMESTAMP_FIELD, SUMMARY_TIMESTAMP_FIELD, SummaryRecord, TrialBatch,
    authorize, ensure_success, layout, FINAL_COLLECTION,
};
use crate::config::AccessToken;
use crate::error::StoreError;
use crate::escape::escape_with;
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue, json};

pub struct DocumentStore {
    client: reqwest::Client,
    commit_url: String,
    documents_root: String,
    access_token: Option<AccessToken>,
}

impl DocumentStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        project_id: impl Into<String>,
        access_token: Option<AccessToken>,
    ) -> Self {
        let project_id = project_id.into();
        let documents_root = format!("projects/{project_id}/databases/(default)/documents");
        let commit_url = format!(
            "{}/v1/{documents_root}:commit",
            base_url.trim_end_matches('/')
        );
        Self {
            client,
            commit_url,
            documents_root,
            access_token,
        }
    }

    /// Request body for one chunk.
    pub fn batch_commit_body(&self, batch: &TrialBatch) -> JsonValue {
        let (collection, subcollection) = layout(batch.kind);
        let parent = format!(
            "{}/{collection}/{}/{subcollection}",
            self.documents_root,
            document_id(&batch.participant_id)
        );

        let writes: Vec<JsonValue> = batch
            .records
            .iter()
            .zip(batch.record_ids())
            .map(|(record, id)| {
                json!({
                    "update": {
                        "name": format!("{parent}/{id}"),
                        "fields": encode_fields(record),
                    },
                    "updateTransforms": [server_time(SERVER_TIMESTAMP_FIELD)],
                })
            })
            .collect();

        json!({ "writes": writes })
    }

    /// Request body merging the summary into the participant document.
    pub fn summary_commit_body(&self, summary: &SummaryRecord) -> JsonValue {
        let fields = summary.merge_fields();
        let field_paths: Vec<&String> = fields.keys().collect();
        json!({
            "writes": [{
                "update": {
                    "name": format!(
                        "{}/{FINAL_COLLECTION}/{}",
                        self.documents_root,
                        document_id(&summary.participant_id)
                    ),
                    "fields": encode_fields(&fields),
                },
                "updateMask": { "fieldPaths": field_paths },
                "updateTransforms": [server_time(SUMMARY_TIMESTAMP_FIELD)],
            }]
        })
    }

    async fn commit(&self, body: &JsonValue) -> Result<(), StoreError> {
        let request = authorize(self.client.post(&self.commit_url), self.access_token.as_ref());
        let response = request.json(body).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError> {
        self.commit(&self.batch_commit_body(batch)).await
    }

    async fn merge_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError> {
        self.commit(&self.summary_commit_body(summary)).await
    }
}

fn server_time(field: &str) -> JsonValue {
    json!({ "fieldPath": field, "setToServerValue": "REQUEST_TIME" })
}

/// Document ids may not contain `/`, may not be `.` or `..`, and may not
/// match `__.*__`. Offending characters are percent-escaped, so distinct ids
/// stay distinct documents.
pub fn document_id(raw: &str) -> String {
    let id = escape_with(raw, |ch| ch == '/');
    if id == "." || id == ".." {
        return escape_with(raw, |_| true);
    }
    if id.len() >= 4 && id.starts_with("__") && id.ends_with("__") {
        return format!("%5F{}", &id[1..]);
    }
    id
}

pub fn encode_fields(fields: &JsonMap<String, JsonValue>) -> JsonValue {
    JsonValue::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), encode_value(value)))
            .collect(),
    )
}

/// Encodes a JSON value as a typed Firestore value.
pub fn encode_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => json!({ "nullValue": null }),
        JsonValue::Bool(flag) => json!({ "booleanValue": flag }),
        JsonValue::Number(number) => match number.as_i64() {
            Some(integer) => json!({ "integerValue": integer.to_string() }),
            None => json!({ "doubleValue": number.as_f64() }),
        },
        JsonValue::String(text) => json!({ "stringValue": text }),
        JsonValue::Array(items) => {
            let values: Vec<JsonValue> = items
                .iter()
                .map(|item| match item {
                    // Arrays cannot directly contain arrays; keep the nested
                    // one as its JSON text.
                    JsonValue::Array(_) => json!({ "stringValue": item.to_string() }),
                    other => encode_value(other),
                })
                .collect();
            json!({ "arrayValue": { "values": values } })
        }
        JsonValue::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}
