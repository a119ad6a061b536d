//! Blob-store backend on the Cloud Storage JSON API.
//!
//! A chunk becomes one JSON-array object; a single object upload is atomic.
//! Objects carry no server-side field transforms, so records are stamped with
//! the local clock. The summary is a separate object updated by
//! read-merge-write.

use super::{
    RemoteStore, SERVER_TIMESTAMP_FIELD, SUMMARY_TIMESTAMP_FIELD, SummaryRecord, TrialBatch,
    authorize, ensure_success, layout, FINAL_COLLECTION,
};
use crate::config::AccessToken;
use crate::error::StoreError;
use crate::escape::escape_with;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub struct BlobStore {
    client: reqwest::Client,
    base_url: Url,
    bucket: String,
    access_token: Option<AccessToken>,
}

impl BlobStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        bucket: impl Into<String>,
        access_token: Option<AccessToken>,
    ) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| StoreError::config(format!("invalid storage base URL: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::config("storage base URL cannot be used as a base"));
        }
        Ok(Self {
            client,
            base_url,
            bucket: bucket.into(),
            access_token,
        })
    }

    pub fn batch_object_name(batch: &TrialBatch) -> String {
        let (collection, subcollection) = layout(batch.kind);
        format!(
            "{collection}/{}/{subcollection}/{}_chunk{:04}.json",
            object_segment(&batch.participant_id),
            batch.source,
            batch.chunk_index
        )
    }

    pub fn summary_object_name(participant_id: &str) -> String {
        format!(
            "{FINAL_COLLECTION}/{}/summary.json",
            object_segment(participant_id)
        )
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::config("storage base URL cannot be used as a base"))?
            .pop_if_empty()
            .extend(segments.iter().copied());
        Ok(url)
    }

    async fn upload(&self, object_name: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        let request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", object_name)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = authorize(request, self.access_token.as_ref()).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn download_object(
        &self,
        object_name: &str,
    ) -> Result<Option<JsonMap<String, JsonValue>>, StoreError> {
        // The object name is a single, fully escaped path segment here.
        let url = self.url(&["storage", "v1", "b", &self.bucket, "o", object_name])?;
        let request = self.client.get(url).query(&[("alt", "media")]);
        let response = authorize(request, self.access_token.as_ref()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        match serde_json::from_slice::<JsonValue>(&bytes)? {
            JsonValue::Object(fields) => Ok(Some(fields)),
            _ => Ok(None),
        }
    }
}

/// Keeps a participant id inside one level of the object hierarchy.
fn object_segment(participant_id: &str) -> String {
    escape_with(participant_id, |ch| ch == '/')
}

#[async_trait]
impl RemoteStore for BlobStore {
    fn name(&self) -> &'static str {
        "blob"
    }

    async fn commit_batch(&self, batch: &TrialBatch) -> Result<(), StoreError> {
        let stamp = JsonValue::String(Utc::now().to_rfc3339());
        let records: Vec<JsonValue> = batch
            .records
            .iter()
            .map(|record| {
                let mut record = record.clone();
                record.insert(SERVER_TIMESTAMP_FIELD.to_string(), stamp.clone());
                JsonValue::Object(record)
            })
            .collect();
        let body = serde_json::to_vec(&records)?;
        self.upload(&Self::batch_object_name(batch), body).await
    }

    async fn merge_summary(&self, summary: &SummaryRecord) -> Result<(), StoreError> {
        let object_name = Self::summary_object_name(&summary.participant_id);
        let mut fields = self
            .download_object(&object_name)
            .await?
            .unwrap_or_default();
        fields.extend(summary.merge_fields());
        fields.insert(
            SUMMARY_TIMESTAMP_FIELD.to_string(),
            JsonValue::String(summary.recorded_at.to_rfc3339()),
        );
        let body = serde_json::to_vec(&JsonValue::Object(fields))?;
        self.upload(&object_name, body).await
    }
}
