use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
    error::{AppError, AppResult},
    kernel::SessionRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionItem {
    pub question_id: String,
    pub code: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub passed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub session_id: String,
    pub answers: Vec<SubmissionItem>,
    pub final_score: FinalScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    #[serde(flatten)]
    pub payload: SubmissionPayload,
    pub submitted_at: DateTime<Utc>,
}

/// Writes one JSON file per session. A later submission for the same
/// session replaces the earlier file.
#[derive(Debug, Clone)]
pub struct SubmissionStore {
    dir: PathBuf,
}

impl SubmissionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("submission_{}.json", file_stem(session_id)))
    }

    pub async fn save(&self, payload: &SubmissionPayload) -> AppResult<PathBuf> {
        let record = SubmissionRecord {
            payload: payload.clone(),
            submitted_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|err| AppError::Persistence(err.to_string()))?;

        let target = self.path_for(&payload.session_id);
        write_atomically(&target, &body)
            .await
            .map_err(|err| AppError::Persistence(format!("{}: {err}", target.display())))?;
        Ok(target)
    }

    /// Persists the submission, then releases the session's kernel. A
    /// missing or already dead kernel is not an error; a failed write is,
    /// and leaves the kernel running. Returns whether a kernel was released.
    pub async fn finalize(
        &self,
        registry: &SessionRegistry,
        payload: &SubmissionPayload,
    ) -> AppResult<bool> {
        let path = self.save(payload).await?;
        tracing::info!(
            session_id = %payload.session_id,
            passed = payload.final_score.passed,
            total = payload.final_score.total,
            path = %path.display(),
            "submission stored"
        );
        let closed = registry.remove_and_teardown(&payload.session_id).await;
        if closed {
            tracing::info!(session_id = %payload.session_id, "session closed after submission");
        }
        Ok(closed)
    }
}

async fn write_atomically(target: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = target.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().as_simple()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    let written = async {
        file.write_all(body).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    Ok(())
}

/// Percent-encodes everything outside `[A-Za-z0-9._~-]`, so distinct ids
/// map to distinct names and no id can introduce a path separator.
fn file_stem(session_id: &str) -> String {
    urlencoding::encode(session_id).into_owned()
}
