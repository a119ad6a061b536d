use std::{path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;
use trialvault::{
    AppState, ChunkFailurePolicy, LocalStaging, MemoryStore, ReplicationPipeline,
    ReplicationQueue, Replicator, SubmissionKind, SummaryRecorder, build_router,
};

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    queue: Arc<ReplicationQueue>,
    data_dir: TempDir,
}

impl Harness {
    fn start(batch_size: usize, body_limit_bytes: usize) -> Self {
        let data_dir = tempdir().expect("temp dir should be created");
        Self::start_in(data_dir, None, batch_size, body_limit_bytes)
    }

    fn start_in(
        data_dir: TempDir,
        staging_root: Option<&Path>,
        batch_size: usize,
        body_limit_bytes: usize,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(ReplicationPipeline::new(
            Replicator::new(store.clone(), batch_size, ChunkFailurePolicy::Continue),
            SummaryRecorder::new(store.clone()),
        ));
        let queue = Arc::new(ReplicationQueue::start(pipeline, 64, 4));
        let root = staging_root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.path().to_path_buf());
        let state = AppState::new(
            Arc::new(LocalStaging::new(root)),
            queue.clone(),
            body_limit_bytes,
        );

        Self {
            app: build_router(state),
            store,
            queue,
            data_dir,
        }
    }

    async fn post(&self, uri: &str, body: impl Into<String>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.into()))
                    .expect("valid request"),
            )
            .await
            .expect("router should respond");

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn drain(&self) {
        let report = self.queue.shutdown(Duration::from_secs(10)).await;
        assert_eq!(report.abandoned, 0, "background replication should drain");
    }

    fn staged_files(&self, kind: SubmissionKind, participant: &str) -> Vec<std::path::PathBuf> {
        let dir = self.data_dir.path().join(kind.as_str()).join(participant);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<_> = entries
            .map(|entry| entry.expect("dir entry").path())
            .collect();
        files.sort();
        files
    }
}

const DEFAULT_LIMIT: usize = 50 * 1024 * 1024;

#[tokio::test]
async fn final_data_is_staged_acknowledged_and_replicated() {
    let harness = Harness::start(500, DEFAULT_LIMIT);
    let body = json!({
        "participantId": "P1",
        "allTrialData": [{ "rt": 100 }, { "rt": 200 }],
        "saveDurationMs": 830
    })
    .to_string();

    let (status, response) = harness.post("/save-final-data", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(response["message"].as_str().is_some());

    let files = harness.staged_files(SubmissionKind::Final, "P1");
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.starts_with("final_") && name.ends_with(".json"), "{name}");
    assert_eq!(std::fs::read(&files[0]).unwrap(), body.as_bytes());

    harness.drain().await;

    let records = harness.store.records_for("P1").await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["rt"], 100);
    assert_eq!(records[1]["rt"], 200);
    assert!(records.iter().all(|record| record["subject_id"] == "P1"));
    assert!(records.iter().all(|record| record.contains_key("server_timestamp")));

    let summary = harness.store.summary("P1").await.expect("summary written");
    assert_eq!(summary["final_save_status"], "completed");
    assert_eq!(summary["trials_saved"], 2);
    assert_eq!(summary["save_duration_ms"], 830.0);
    assert!(summary.contains_key("final_save_timestamp"));
}

#[tokio::test]
async fn missing_participant_is_rejected_without_any_write() {
    let harness = Harness::start(500, DEFAULT_LIMIT);

    let (status, response) = harness.post("/save-final-data", "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response, json!({ "error": "Missing participantId" }));

    let (status, response) = harness
        .post(
            "/save-final-data",
            json!({ "participantId": "P1", "allTrialData": [] }).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        response,
        json!({ "error": "Missing or empty allTrialData array" })
    );

    let (status, _) = harness.post("/save-final-data", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    harness.drain().await;
    assert!(!harness.data_dir.path().join("final").exists());
    assert!(harness.store.committed_batches().await.is_empty());
    assert_eq!(harness.store.summary_count().await, 0);
}

#[tokio::test]
async fn repeated_final_submissions_keep_both_files_and_one_summary() {
    let harness = Harness::start(500, DEFAULT_LIMIT);

    for rt in [100, 200] {
        let (status, _) = harness
            .post(
                "/save-final-data",
                json!({ "participantId": "P1", "allTrialData": [{ "rt": rt }] }).to_string(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let files = harness.staged_files(SubmissionKind::Final, "P1");
    assert_eq!(files.len(), 2);
    assert_ne!(files[0], files[1]);

    harness.drain().await;
    assert_eq!(harness.store.committed_batches().await.len(), 2);
    assert_eq!(harness.store.summary_count().await, 1);
    let summary = harness.store.summary("P1").await.unwrap();
    assert_eq!(summary["final_save_status"], "completed");
    assert_eq!(summary["trials_saved"], 1);
}

#[tokio::test]
async fn large_submission_is_replicated_in_ordered_chunks() {
    let harness = Harness::start(500, DEFAULT_LIMIT);
    let trials: Vec<Value> = (0..1200).map(|index| json!({ "trial_index": index })).collect();

    let (status, _) = harness
        .post(
            "/save-final-data",
            json!({ "participantId": "P9", "allTrialData": trials }).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    harness.drain().await;

    let batches = harness.store.committed_batches().await;
    let sizes: Vec<_> = batches.iter().map(|batch| batch.records.len()).collect();
    assert_eq!(sizes, vec![500, 500, 200]);
    let chunk_indices: Vec<_> = batches.iter().map(|batch| batch.chunk_index).collect();
    assert_eq!(chunk_indices, vec![0, 1, 2]);

    let order: Vec<_> = harness
        .store
        .records_for("P9")
        .await
        .iter()
        .map(|record| record["trial_index"].as_u64().unwrap())
        .collect();
    assert_eq!(order, (0..1200).collect::<Vec<u64>>());
}

#[tokio::test]
async fn single_trial_is_staged_and_replicated_without_summary() {
    let harness = Harness::start(500, DEFAULT_LIMIT);

    let (status, response) = harness
        .post(
            "/save-trial-data",
            json!({ "participantId": "P2", "trialData": { "rt": 5, "response": "f" } })
                .to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(response["message"].is_string());
    assert_eq!(harness.staged_files(SubmissionKind::Trial, "P2").len(), 1);

    let (status, response) = harness
        .post(
            "/save-trial-data",
            json!({ "participantId": "P2" }).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response, json!({ "error": "Missing trialData object" }));

    harness.drain().await;
    let batches = harness.store.committed_batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].kind, SubmissionKind::Trial);
    assert_eq!(batches[0].records[0]["subject_id"], "P2");
    assert!(harness.store.summary("P2").await.is_none());
}

#[tokio::test]
async fn local_write_failure_returns_500_and_skips_replication() {
    let data_dir = tempdir().unwrap();
    let blocker = data_dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let harness = Harness::start_in(data_dir, Some(&blocker), 500, DEFAULT_LIMIT);

    let (status, response) = harness
        .post(
            "/save-final-data",
            json!({ "participantId": "P1", "allTrialData": [{ "rt": 1 }] }).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response["error"].is_string());

    harness.drain().await;
    assert!(harness.store.committed_batches().await.is_empty());
    assert_eq!(harness.store.summary_count().await, 0);
}

#[tokio::test]
async fn bodies_over_the_limit_are_refused() {
    let harness = Harness::start(500, 64);
    let trials: Vec<Value> = (0..50).map(|index| json!({ "trial_index": index })).collect();

    let (status, _) = harness
        .post(
            "/save-final-data",
            json!({ "participantId": "P1", "allTrialData": trials }).to_string(),
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(harness.staged_files(SubmissionKind::Final, "P1").is_empty());
}

#[tokio::test]
async fn liveness_route_answers_with_plain_text() {
    let harness = Harness::start(500, DEFAULT_LIMIT);
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/")
                .body(Body::empty())
                .expect("valid request"),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"jsPsych backend is running.");
}
