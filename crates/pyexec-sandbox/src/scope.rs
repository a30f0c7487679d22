//! Execution scopes
//!
//! One scope per request: a uniquely named directory holding the serialized
//! input context, every generated candidate, the runner and its report, and
//! whatever artifacts the user code produced. The layout is the only state
//! persisted by the pipeline and is kept reproducible for post-mortems.
//!
//! ```text
//! <base>/<timestamp>_<label>_<ulid>/
//!     context.json            {"context": ..., "request": ...}
//!     generated_code.py
//!     _runner.py
//!     execution_report.json
//!     attempts/attempt_01.py, attempt_01.stdout.txt, attempt_01.stderr.txt
//!     artifacts/
//!     scope_metadata.json
//! ```

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use ulid::Ulid;
use walkdir::WalkDir;

/// Latest candidate, executed by the runner
pub const CODE_FILE: &str = "generated_code.py";
/// Serialized input context
pub const CONTEXT_FILE: &str = "context.json";
/// Runner script
pub const RUNNER_FILE: &str = "_runner.py";
/// Runner report for the latest attempt
pub const REPORT_FILE: &str = "execution_report.json";
/// Final scope summary
pub const METADATA_FILE: &str = "scope_metadata.json";
/// Per-attempt snapshots
pub const ATTEMPTS_DIR: &str = "attempts";
/// User-produced files
pub const ARTIFACTS_DIR: &str = "artifacts";
/// Archived scopes, relative to the base directory
pub const ARCHIVE_DIR: &str = "archive";

/// Unique scope identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub Ulid);

impl ScopeId {
    /// Generate new scope ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens to a scope directory when its request ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeRetention {
    /// Leave in place
    #[default]
    Retain,
    /// Move under `<base>/archive/`
    Archive,
    /// Delete succeeded scopes, keep failed ones for debugging
    DeleteOnSuccess,
    /// Always delete
    Delete,
}

/// Terminal status recorded in `scope_metadata.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStatus {
    /// Request produced results
    Succeeded,
    /// Request failed terminally
    Failed,
    /// Request is waiting for human approval
    AwaitingApproval,
    /// Request was cancelled by the caller
    Cancelled,
}

/// Summary written when a scope is finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSummary {
    /// Terminal status
    pub status: ScopeStatus,
    /// Attempts made
    pub attempts: u32,
    /// Terminal reason for failures
    pub reason: Option<String>,
    /// Completion time (RFC 3339)
    pub finished_at: String,
}

impl ScopeSummary {
    /// Create summary stamped with the current time
    #[must_use]
    pub fn new(status: ScopeStatus, attempts: u32, reason: Option<String>) -> Self {
        Self {
            status,
            attempts,
            reason,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Per-request working directory
///
/// Owned by exactly one request; never shared across requests or run
/// concurrently.
#[derive(Debug)]
pub struct ExecutionScope {
    id: ScopeId,
    base_dir: PathBuf,
    root: PathBuf,
}

impl ExecutionScope {
    /// Create a fresh scope directory under `base_dir`
    ///
    /// The directory name combines a UTC timestamp, a sanitized `label` and
    /// the scope ULID, so concurrent requests never collide.
    ///
    /// # Errors
    /// Returns `SandboxError::Io` if the directories cannot be created.
    pub async fn create(base_dir: impl AsRef<Path>, label: &str) -> Result<Self, SandboxError> {
        let id = ScopeId::new();
        let base_dir = base_dir.as_ref().to_path_buf();
        let dir_name = format!(
            "{}_{}_{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S"),
            sanitize_label(label),
            id
        );
        let root = base_dir.join(dir_name);

        for dir in [root.join(ATTEMPTS_DIR), root.join(ARTIFACTS_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::io_error(&dir, e))?;
        }

        tracing::debug!(scope = %id, root = %root.display(), "execution scope created");
        Ok(Self { id, base_dir, root })
    }

    /// Scope identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Scope directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the latest candidate
    #[inline]
    #[must_use]
    pub fn code_path(&self) -> PathBuf {
        self.root.join(CODE_FILE)
    }

    /// Path of the serialized context
    #[inline]
    #[must_use]
    pub fn context_path(&self) -> PathBuf {
        self.root.join(CONTEXT_FILE)
    }

    /// Path of the runner script
    #[inline]
    #[must_use]
    pub fn runner_path(&self) -> PathBuf {
        self.root.join(RUNNER_FILE)
    }

    /// Path of the runner report
    #[inline]
    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILE)
    }

    /// Artifacts directory
    #[inline]
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    /// Attempt snapshot directory
    #[inline]
    #[must_use]
    pub fn attempts_dir(&self) -> PathBuf {
        self.root.join(ATTEMPTS_DIR)
    }

    /// Serialize the input context and request metadata
    ///
    /// The runner exposes `context` to the code; `request` is kept for
    /// post-mortems.
    ///
    /// # Errors
    /// Serialization or IO failure.
    pub async fn write_context(
        &self,
        context: &serde_json::Value,
        request: &serde_json::Value,
    ) -> Result<PathBuf, SandboxError> {
        let path = self.context_path();
        let payload = serde_json::json!({ "context": context, "request": request });
        let bytes = serde_json::to_vec_pretty(&payload)?;
        write_file(&path, &bytes).await?;
        Ok(path)
    }

    /// Write the candidate the runner will execute next
    ///
    /// # Errors
    /// IO failure.
    pub async fn write_code(&self, code: &str) -> Result<PathBuf, SandboxError> {
        let path = self.code_path();
        write_file(&path, code.as_bytes()).await?;
        Ok(path)
    }

    /// Write the runner script
    ///
    /// # Errors
    /// IO failure.
    pub async fn write_runner(&self, source: &str) -> Result<PathBuf, SandboxError> {
        let path = self.runner_path();
        write_file(&path, source.as_bytes()).await?;
        Ok(path)
    }

    /// Remove the previous attempt's report
    ///
    /// # Errors
    /// IO failure other than the report not existing.
    pub async fn clear_report(&self) -> Result<(), SandboxError> {
        let path = self.report_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::io_error(path, e)),
        }
    }

    /// Snapshot a candidate as `attempts/attempt_NN.py`
    ///
    /// # Errors
    /// IO failure.
    pub async fn snapshot_attempt(&self, attempt: u32, code: &str) -> Result<PathBuf, SandboxError> {
        let path = self.attempts_dir().join(format!("attempt_{attempt:02}.py"));
        write_file(&path, code.as_bytes()).await?;
        Ok(path)
    }

    /// Save captured process output for an attempt
    ///
    /// # Errors
    /// IO failure.
    pub async fn save_attempt_output(
        &self,
        attempt: u32,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), SandboxError> {
        let dir = self.attempts_dir();
        write_file(&dir.join(format!("attempt_{attempt:02}.stdout.txt")), stdout.as_bytes()).await?;
        write_file(&dir.join(format!("attempt_{attempt:02}.stderr.txt")), stderr.as_bytes()).await
    }

    /// Write a file into the artifacts directory
    ///
    /// # Errors
    /// IO failure.
    pub async fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, SandboxError> {
        let path = self.artifacts_dir().join(name);
        write_file(&path, bytes).await?;
        Ok(path)
    }

    /// Every file under `artifacts/`, sorted
    ///
    /// # Errors
    /// IO failure while walking the directory.
    pub async fn list_artifacts(&self) -> Result<Vec<PathBuf>, SandboxError> {
        let dir = self.artifacts_dir();
        let walk_root = dir.clone();
        tokio::task::spawn_blocking(move || walk_files(&walk_root))
            .await
            .map_err(|e| SandboxError::io_error(&dir, std::io::Error::other(e)))?
    }

    /// Record the summary and apply the retention policy
    ///
    /// Returns where the scope now lives, or `None` if it was deleted.
    ///
    /// # Errors
    /// IO or serialization failure.
    pub async fn finish(
        self,
        summary: &ScopeSummary,
        retention: ScopeRetention,
    ) -> Result<Option<PathBuf>, SandboxError> {
        let metadata = serde_json::to_vec_pretty(summary)?;
        write_file(&self.root.join(METADATA_FILE), &metadata).await?;

        let delete = match retention {
            ScopeRetention::Delete => true,
            ScopeRetention::DeleteOnSuccess => summary.status == ScopeStatus::Succeeded,
            ScopeRetention::Retain | ScopeRetention::Archive => false,
        };

        if delete {
            tokio::fs::remove_dir_all(&self.root)
                .await
                .map_err(|e| SandboxError::io_error(&self.root, e))?;
            tracing::debug!(scope = %self.id, "execution scope deleted");
            return Ok(None);
        }

        if retention == ScopeRetention::Archive {
            let archive = self.base_dir.join(ARCHIVE_DIR);
            tokio::fs::create_dir_all(&archive)
                .await
                .map_err(|e| SandboxError::io_error(&archive, e))?;
            let name = self.root.file_name().map(ToOwned::to_owned).unwrap_or_default();
            let target = archive.join(name);
            tokio::fs::rename(&self.root, &target)
                .await
                .map_err(|e| SandboxError::io_error(&self.root, e))?;
            tracing::debug!(scope = %self.id, target = %target.display(), "execution scope archived");
            return Ok(Some(target));
        }

        Ok(Some(self.root))
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SandboxError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| SandboxError::io_error(path, e))
}

/// Keep `[A-Za-z0-9_-]`, collapse the rest to `_`, cap at 40 characters
fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len().min(40));
    for c in label.chars().take(40) {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "scope".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Regular files below `root`, sorted; a missing `root` is empty
fn walk_files(root: &Path) -> Result<Vec<PathBuf>, SandboxError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 && e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                return Ok(files);
            }
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                return Err(SandboxError::io_error(&path, std::io::Error::other(e)));
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_label_rules() {
        assert_eq!(sanitize_label("beam current/analysis"), "beam_current_analysis");
        assert_eq!(sanitize_label("   "), "scope");
        assert_eq!(sanitize_label("step-1"), "step-1");
        assert_eq!(sanitize_label(&"x".repeat(100)).len(), 40);
    }

    #[tokio::test]
    async fn create_builds_layout() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "step").await.unwrap();

        assert!(scope.root().starts_with(base.path()));
        assert!(scope.artifacts_dir().is_dir());
        assert!(scope.attempts_dir().is_dir());
    }

    #[tokio::test]
    async fn scopes_never_collide() {
        let base = tempfile::tempdir().unwrap();
        let a = ExecutionScope::create(base.path(), "same").await.unwrap();
        let b = ExecutionScope::create(base.path(), "same").await.unwrap();
        assert_ne!(a.root(), b.root());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn files_land_in_expected_places() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "files").await.unwrap();

        scope
            .write_context(&serde_json::json!({"pv": "SR:DCCT"}), &serde_json::json!({"id": "r1"}))
            .await
            .unwrap();
        scope.write_code("results = {}\n").await.unwrap();
        let snapshot = scope.snapshot_attempt(3, "x = 1\n").await.unwrap();
        scope.save_attempt_output(3, "out", "err").await.unwrap();

        assert_eq!(std::fs::read_to_string(scope.code_path()).unwrap(), "results = {}\n");
        assert!(snapshot.ends_with("attempts/attempt_03.py"));
        assert!(scope.attempts_dir().join("attempt_03.stderr.txt").is_file());

        let context: serde_json::Value =
            serde_json::from_slice(&std::fs::read(scope.context_path()).unwrap()).unwrap();
        assert_eq!(context["context"]["pv"], "SR:DCCT");
        assert_eq!(context["request"]["id"], "r1");
    }

    #[tokio::test]
    async fn artifacts_listed_recursively() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "artifacts").await.unwrap();
        scope.write_artifact("b.png", b"png").await.unwrap();
        std::fs::create_dir_all(scope.artifacts_dir().join("nested")).unwrap();
        std::fs::write(scope.artifacts_dir().join("nested/a.csv"), "1,2").unwrap();

        let files = scope.list_artifacts().await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("nested/a.csv")));
    }

    #[tokio::test]
    async fn artifacts_walk_deep_trees_in_order_and_skips_dirs() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "deep").await.unwrap();
        let root = scope.artifacts_dir();
        std::fs::create_dir_all(root.join("plots/2024/jan")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("plots/2024/jan/current.png"), "png").unwrap();
        std::fs::write(root.join("plots/summary.csv"), "x").unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();

        let files = scope.list_artifacts().await.unwrap();
        let relative: Vec<_> = files
            .iter()
            .map(|f| f.strip_prefix(&root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            relative,
            vec!["a.txt", "plots/2024/jan/current.png", "plots/summary.csv"]
        );
    }

    #[tokio::test]
    async fn missing_artifacts_dir_lists_nothing() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "gone").await.unwrap();
        std::fs::remove_dir_all(scope.artifacts_dir()).unwrap();
        assert!(scope.list_artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_report_tolerates_missing_file() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "report").await.unwrap();
        scope.clear_report().await.unwrap();
        std::fs::write(scope.report_path(), "{}").unwrap();
        scope.clear_report().await.unwrap();
        assert!(!scope.report_path().exists());
    }

    #[tokio::test]
    async fn finish_retain_writes_metadata() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "retain").await.unwrap();
        let summary = ScopeSummary::new(ScopeStatus::Failed, 2, Some("failed".into()));

        let location = scope.finish(&summary, ScopeRetention::Retain).await.unwrap().unwrap();
        let meta: ScopeSummary =
            serde_json::from_slice(&std::fs::read(location.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(meta.status, ScopeStatus::Failed);
        assert_eq!(meta.attempts, 2);
    }

    #[tokio::test]
    async fn finish_archive_moves_directory() {
        let base = tempfile::tempdir().unwrap();
        let scope = ExecutionScope::create(base.path(), "archive").await.unwrap();
        let original = scope.root().to_path_buf();
        let summary = ScopeSummary::new(ScopeStatus::Succeeded, 1, None);

        let location = scope.finish(&summary, ScopeRetention::Archive).await.unwrap().unwrap();
        assert!(!original.exists());
        assert!(location.starts_with(base.path().join(ARCHIVE_DIR)));
        assert!(location.join(METADATA_FILE).is_file());
    }

    #[tokio::test]
    async fn delete_on_success_keeps_failures() {
        let base = tempfile::tempdir().unwrap();

        let ok = ExecutionScope::create(base.path(), "ok").await.unwrap();
        let ok_root = ok.root().to_path_buf();
        let gone = ok
            .finish(&ScopeSummary::new(ScopeStatus::Succeeded, 1, None), ScopeRetention::DeleteOnSuccess)
            .await
            .unwrap();
        assert!(gone.is_none());
        assert!(!ok_root.exists());

        let bad = ExecutionScope::create(base.path(), "bad").await.unwrap();
        let kept = bad
            .finish(&ScopeSummary::new(ScopeStatus::Failed, 3, None), ScopeRetention::DeleteOnSuccess)
            .await
            .unwrap();
        assert!(kept.is_some_and(|p| p.exists()));
    }
}
