// ============================================================================
// trialvault: durable ingest for browser-based experiments
// ============================================================================

pub mod app;
pub mod config;
pub mod error;
pub mod escape;
pub mod interface;
pub mod pipeline;
pub mod queue;
pub mod replay;
pub mod replicator;
pub mod staging;
pub mod state;
pub mod store;
pub mod submission;
pub mod summary;

pub use app::build_router;
pub use config::{AppConfig, RemoteBackend, RemoteConfig};
pub use error::{StoreError, SubmissionError};
pub use pipeline::{JobOutcome, ReplicationPipeline};
pub use queue::{ReplicationQueue, ShutdownReport};
pub use replicator::{ChunkFailurePolicy, ReplicationJob, ReplicationReport, Replicator};
pub use staging::LocalStaging;
pub use state::AppState;
pub use store::{MemoryStore, RemoteStore, SummaryRecord, SummaryStatus, TrialBatch};
pub use submission::{Submission, SubmissionKind, TrialRecord};
pub use summary::{SummaryOutcome, SummaryRecorder};
