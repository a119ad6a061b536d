//! Local staging: the durability floor every submission must reach before it
//! is acknowledged.
//!
//! Layout: `<root>/<kind>/<participant>/<kind>_<unix-millis>.json`. Files are
//! created with `create_new` and never touched again.

use crate::error::{Result, SubmissionError};
use crate::escape::escape_with;
use crate::submission::SubmissionKind;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_STAGING_TIMEOUT: Duration = Duration::from_secs(30);

// Suffixes tried when several submissions land in the same millisecond.
const MAX_NAME_ATTEMPTS: u32 = 64;

#[derive(Debug, Clone)]
pub struct LocalStaging {
    root: PathBuf,
    write_timeout: Duration,
}

impl LocalStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_timeout: DEFAULT_STAGING_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every staged file of one participant for one kind.
    pub fn participant_dir(&self, kind: SubmissionKind, participant_id: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(path_component(participant_id))
    }

    /// Writes `payload` verbatim to a new staging file and returns its path
    /// once the data has been synced to disk. The write timeout covers the
    /// write and the sync; a file that misses it is removed again.
    pub async fn stage(
        &self,
        kind: SubmissionKind,
        participant_id: &str,
        payload: &[u8],
    ) -> Result<PathBuf> {
        let (path, mut file) = self.create_new_file(kind, participant_id).await?;

        let written = timeout(self.write_timeout, async {
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await
        })
        .await;

        let failure = match written {
            Ok(Ok(())) => {
                debug!(path = %path.display(), bytes = payload.len(), "staged submission");
                return Ok(path);
            }
            Ok(Err(err)) => format!("failed to write staging file '{}': {}", path.display(), err),
            Err(_) => format!(
                "staging write to '{}' timed out after {}s",
                path.display(),
                self.write_timeout.as_secs_f64()
            ),
        };

        drop(file);
        if let Err(cleanup) = fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %cleanup, "failed to remove partial staging file");
        }
        Err(SubmissionError::local_persistence(failure))
    }

    async fn create_new_file(
        &self,
        kind: SubmissionKind,
        participant_id: &str,
    ) -> Result<(PathBuf, fs::File)> {
        let dir = self.participant_dir(kind, participant_id);
        fs::create_dir_all(&dir).await.map_err(|err| {
            SubmissionError::local_persistence(format!(
                "failed to create staging directory '{}': {}",
                dir.display(),
                err
            ))
        })?;

        let stamp_ms = Utc::now().timestamp_millis();
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(staging_file_name(kind, stamp_ms, attempt));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(SubmissionError::local_persistence(format!(
                        "failed to create staging file '{}': {}",
                        path.display(),
                        err
                    )));
                }
            }
        }

        Err(SubmissionError::local_persistence(format!(
            "no free staging file name in '{}' for timestamp {stamp_ms}",
            dir.display()
        )))
    }
}

/// `final_1700000000000.json`, then `final_1700000000000-1.json` and so on.
pub fn staging_file_name(kind: SubmissionKind, stamp_ms: i64, attempt: u32) -> String {
    if attempt == 0 {
        format!("{kind}_{stamp_ms}.json")
    } else {
        format!("{kind}_{stamp_ms}-{attempt}.json")
    }
}

/// Recovers the submission kind from a staging file name.
pub fn kind_from_file_name(name: &str) -> Option<SubmissionKind> {
    let (prefix, _) = name.split_once('_')?;
    SubmissionKind::parse(prefix)
}

/// Maps a participant id onto one path component that cannot leave the
/// staging root. Everything but ASCII alphanumerics, `-` and `_` is escaped,
/// so distinct ids get distinct directories.
pub fn path_component(raw: &str) -> String {
    escape_with(raw, |ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_')))
}
