//! Durable per-phase progress for multi-step pipelines.
//!
//! One JSON file per checkpoint under a lazily-created directory. A pipeline
//! run ([`CheckpointManager::execute`]) skips phases that already have a
//! checkpoint, feeding the stored data forward; full success clears the
//! operation's checkpoints, and any failure leaves them intact for a later
//! retry.
//!
//! Checkpointing is a safety net around the primary work, so its own IO
//! failures never abort that work: a failed save or an unreadable file is
//! logged and downgraded to "no checkpoint".

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Checkpoint storage configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files. Created on first save.
    pub dir: PathBuf,
    /// Newest checkpoints retained per operation.
    pub max_checkpoints: usize,
    /// When false, saves are no-ops and loads find nothing.
    pub enabled: bool,
}

impl CheckpointConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoints: 10,
            enabled: true,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            max_checkpoints: 10,
            enabled: false,
        }
    }
}

/// A persisted snapshot of one phase's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint<T> {
    pub id: String,
    pub operation: String,
    pub phase: String,
    pub data: T,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Value>,
}

/// Borrowed view used for writing, so `save` does not need owned data.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointFile<'a, T> {
    id: &'a str,
    operation: &'a str,
    phase: &'a str,
    data: &'a T,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

/// One named step of a checkpointed pipeline.
///
/// The closure receives the previous phase's output (`None` for the first
/// phase) and produces this phase's output.
pub struct PipelinePhase<T> {
    name: String,
    run: Box<dyn FnMut(Option<T>) -> BoxFuture<'static, anyhow::Result<T>> + Send>,
}

impl<T> PipelinePhase<T> {
    pub fn new<F, Fut>(name: impl Into<String>, mut run: F) -> Self
    where
        F: FnMut(Option<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |prev| Box::pin(run(prev))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for PipelinePhase<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePhase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Persists and resumes per-phase pipeline progress.
#[derive(Debug)]
pub struct CheckpointManager {
    config: CheckpointConfig,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Persist one phase's output. Returns the checkpoint id, or `None` when
    /// checkpointing is disabled or the write failed (failure is logged, not
    /// raised: a lost checkpoint must not abort the pipeline).
    pub async fn save<T: Serialize + Sync>(
        &self,
        operation: &str,
        phase: &str,
        data: &T,
        metadata: Option<serde_json::Value>,
    ) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        if let Err(e) = fs::create_dir_all(&self.config.dir).await {
            tracing::warn!(dir = %self.config.dir.display(), error = %e, "Cannot create checkpoint directory");
            return None;
        }

        let created_at = Utc::now();
        let id = format!(
            "{operation}-{phase}-{}-{:06x}",
            created_at.timestamp_millis(),
            rand::random::<u32>() & 0xFF_FFFF
        );

        let file = CheckpointFile {
            id: &id,
            operation,
            phase,
            data,
            created_at,
            metadata: metadata.as_ref(),
        };
        let body = match serde_json::to_vec_pretty(&file) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(operation, phase, error = %e, "Cannot serialize checkpoint");
                return None;
            }
        };

        let path = self.path_for(&id);
        if let Err(e) = fs::write(&path, body).await {
            tracing::warn!(path = %path.display(), error = %e, "Cannot write checkpoint");
            return None;
        }

        self.prune(operation).await;
        Some(id)
    }

    /// Load one checkpoint by id. IO and parse failures are logged and
    /// reported as absence.
    pub async fn load<T: DeserializeOwned>(&self, id: &str) -> Option<Checkpoint<T>> {
        if !self.config.enabled {
            return None;
        }

        let path = self.path_for(id);
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read checkpoint");
                return None;
            }
        };

        match serde_json::from_slice(&body) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed checkpoint file");
                None
            }
        }
    }

    /// All checkpoints for `operation`, newest first.
    ///
    /// Data is left as raw JSON; use [`load`](Self::load) or
    /// [`get_latest`](Self::get_latest) for typed access. Unreadable files
    /// are logged and skipped.
    pub async fn list(&self, operation: &str) -> Vec<Checkpoint<serde_json::Value>> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut dir = match fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.config.dir.display(), error = %e, "Cannot list checkpoints");
                return Vec::new();
            }
        };

        let mut checkpoints = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let body = match fs::read(&path).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read checkpoint");
                    continue;
                }
            };
            match serde_json::from_slice::<Checkpoint<serde_json::Value>>(&body) {
                Ok(checkpoint) if checkpoint.operation == operation => {
                    checkpoints.push(checkpoint);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed checkpoint file");
                }
            }
        }

        // Newest first. The id embeds the creation timestamp; created_at
        // breaks same-millisecond ties.
        checkpoints.sort_by_key(|cp| {
            std::cmp::Reverse((id_timestamp(&cp.id).unwrap_or(0), cp.created_at))
        });
        checkpoints
    }

    /// The newest checkpoint for `operation`, optionally restricted to one
    /// phase.
    pub async fn get_latest<T: DeserializeOwned>(
        &self,
        operation: &str,
        phase: Option<&str>,
    ) -> Option<Checkpoint<T>> {
        let found = self
            .list(operation)
            .await
            .into_iter()
            .find(|cp| phase.is_none_or(|p| cp.phase == p))?;

        match serde_json::from_value(found.data) {
            Ok(data) => Some(Checkpoint {
                id: found.id,
                operation: found.operation,
                phase: found.phase,
                data,
                created_at: found.created_at,
                metadata: found.metadata,
            }),
            Err(e) => {
                tracing::warn!(id = %found.id, error = %e, "Checkpoint data has unexpected shape");
                None
            }
        }
    }

    /// Delete one checkpoint. Returns whether a file was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot delete checkpoint");
                false
            }
        }
    }

    /// Delete all checkpoints for `operation`. Returns how many were removed.
    pub async fn clear(&self, operation: &str) -> usize {
        let mut removed = 0;
        for checkpoint in self.list(operation).await {
            if self.delete(&checkpoint.id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Delete every checkpoint file in the directory.
    pub async fn clear_all(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let mut dir = match fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(_) => return 0,
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Run an ordered list of phases with checkpointed resume.
    ///
    /// A phase that already has a checkpoint is skipped and its stored data
    /// fed forward. Each completed phase is checkpointed before the next
    /// starts. A phase error aborts the run, leaving checkpoints for retry;
    /// full success clears the operation's checkpoints.
    pub async fn execute<T>(
        &self,
        operation: &str,
        mut phases: Vec<PipelinePhase<T>>,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let mut previous: Option<T> = None;

        for phase in &mut phases {
            if let Some(checkpoint) = self.get_latest::<T>(operation, Some(phase.name())).await {
                tracing::debug!(
                    operation,
                    phase = %phase.name(),
                    checkpoint = %checkpoint.id,
                    "Resuming phase from checkpoint"
                );
                previous = Some(checkpoint.data);
                continue;
            }

            let output = (phase.run)(previous.take())
                .await
                .with_context(|| format!("pipeline '{operation}' failed at phase '{}'", phase.name))?;
            self.save(operation, &phase.name, &output, None).await;
            previous = Some(output);
        }

        let result =
            previous.ok_or_else(|| anyhow!("pipeline '{operation}' has no phases"))?;
        self.clear(operation).await;
        Ok(result)
    }

    /// Load one checkpoint and run a continuation from it. The checkpoint is
    /// deleted only when the continuation succeeds; on failure it stays for
    /// another attempt.
    pub async fn resume<T, R, F, Fut>(&self, id: &str, continue_fn: F) -> anyhow::Result<R>
    where
        T: DeserializeOwned,
        F: FnOnce(Checkpoint<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let checkpoint = self
            .load::<T>(id)
            .await
            .ok_or_else(|| anyhow!("checkpoint '{id}' not found"))?;

        let result = continue_fn(checkpoint).await?;
        self.delete(id).await;
        Ok(result)
    }

    /// Drop old checkpoints so at most `max_checkpoints` remain for
    /// `operation`.
    async fn prune(&self, operation: &str) {
        let checkpoints = self.list(operation).await;
        for stale in checkpoints.iter().skip(self.config.max_checkpoints) {
            tracing::debug!(id = %stale.id, "Pruning old checkpoint");
            self.delete(&stale.id).await;
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        Path::new(&self.config.dir).join(format!("{id}.json"))
    }
}

/// Millisecond timestamp embedded in a checkpoint id
/// (`{operation}-{phase}-{timestamp}-{random}`). Operation and phase may
/// themselves contain dashes, so parse from the right.
fn id_timestamp(id: &str) -> Option<i64> {
    let mut parts = id.rsplitn(3, '-');
    let _random = parts.next()?;
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::{CheckpointConfig, CheckpointManager, PipelinePhase, id_timestamp};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PhaseData {
        step: String,
        value: u32,
    }

    fn manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(CheckpointConfig::new(dir.path()))
    }

    #[test]
    fn id_timestamp_parses_from_the_right() {
        assert_eq!(id_timestamp("op-phase-1700000000000-a1b2c3"), Some(1_700_000_000_000));
        // Dashes in operation/phase do not confuse the parse.
        assert_eq!(id_timestamp("my-op-my-phase-42-ffffff"), Some(42));
        assert_eq!(id_timestamp("garbage"), None);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let data = PhaseData {
            step: "analyze".to_string(),
            value: 7,
        };
        let id = manager
            .save("prd", "analyze", &data, Some(serde_json::json!({"model": "test"})))
            .await
            .expect("save should succeed");
        assert!(id.starts_with("prd-analyze-"));

        let loaded = manager.load::<PhaseData>(&id).await.unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.operation, "prd");
        assert_eq!(loaded.phase, "analyze");
        assert_eq!(loaded.metadata, Some(serde_json::json!({"model": "test"})));
    }

    #[tokio::test]
    async fn file_format_is_camel_case_with_iso_timestamp() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let id = manager
            .save("op", "phase", &serde_json::json!({"k": 1}), None)
            .await
            .unwrap();

        let body = std::fs::read_to_string(dir.path().join(format!("{id}.json"))).unwrap();
        assert!(body.contains("\"createdAt\""), "{body}");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        let created_at = parsed["createdAt"].as_str().unwrap();
        assert!(
            chrono::DateTime::parse_from_rfc3339(created_at).is_ok(),
            "createdAt should be ISO-8601: {created_at}"
        );
        // Metadata is omitted entirely when absent.
        assert!(parsed.get("metadata").is_none());
    }

    #[tokio::test]
    async fn disabled_manager_is_inert() {
        let manager = CheckpointManager::new(CheckpointConfig::disabled());
        let id = manager.save("op", "phase", &1u32, None).await;
        assert!(id.is_none());
        assert!(manager.list("op").await.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_newest_max_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::new(dir.path());
        config.max_checkpoints = 2;
        let manager = CheckpointManager::new(config);

        let mut ids = Vec::new();
        for i in 0..4u32 {
            ids.push(manager.save("op", "phase", &i, None).await.unwrap());
            // Distinct millisecond timestamps keep ordering unambiguous.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let listed = manager.list("op").await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[3]);
        assert_eq!(listed[1].id, ids[2]);
    }

    #[tokio::test]
    async fn get_latest_filters_by_phase() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.save("op", "first", &1u32, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        manager.save("op", "second", &2u32, None).await.unwrap();

        let latest = manager.get_latest::<u32>("op", None).await.unwrap();
        assert_eq!(latest.phase, "second");

        let first = manager.get_latest::<u32>("op", Some("first")).await.unwrap();
        assert_eq!(first.data, 1);

        assert!(manager.get_latest::<u32>("op", Some("missing")).await.is_none());
        assert!(manager.get_latest::<u32>("other-op", None).await.is_none());
    }

    #[tokio::test]
    async fn malformed_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.save("op", "phase", &1u32, None).await.unwrap();
        std::fs::write(dir.path().join("op-bad-0-000000.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a checkpoint").unwrap();

        assert_eq!(manager.list("op").await.len(), 1);
    }

    #[tokio::test]
    async fn clear_removes_only_that_operation() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.save("keep", "phase", &1u32, None).await.unwrap();
        manager.save("drop", "phase", &2u32, None).await.unwrap();
        manager.save("drop", "other", &3u32, None).await.unwrap();

        assert_eq!(manager.clear("drop").await, 2);
        assert!(manager.list("drop").await.is_empty());
        assert_eq!(manager.list("keep").await.len(), 1);

        assert_eq!(manager.clear_all().await, 1);
        assert!(manager.list("keep").await.is_empty());
    }

    #[tokio::test]
    async fn execute_checkpoints_each_phase_and_clears_on_success() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let result = manager
            .execute(
                "pipeline",
                vec![
                    PipelinePhase::new("one", |_prev: Option<u32>| async move { Ok(1u32) }),
                    PipelinePhase::new("two", |prev: Option<u32>| async move {
                        Ok(prev.unwrap_or(0) + 10)
                    }),
                ],
            )
            .await
            .unwrap();

        assert_eq!(result, 11);
        // No residue after success.
        assert!(manager.list("pipeline").await.is_empty());
    }

    #[tokio::test]
    async fn execute_resumes_after_failed_phase() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let phase_one_runs = Arc::new(AtomicU32::new(0));

        let make_phases = |fail_second: bool, runs: Arc<AtomicU32>| {
            vec![
                PipelinePhase::new("one", move |_prev: Option<u32>| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(5u32)
                    }
                }),
                PipelinePhase::new("two", move |prev: Option<u32>| async move {
                    if fail_second {
                        anyhow::bail!("phase two exploded")
                    }
                    Ok(prev.unwrap_or(0) * 2)
                }),
            ]
        };

        let err = manager
            .execute("pipeline", make_phases(true, Arc::clone(&phase_one_runs)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("phase 'two'"));
        assert_eq!(phase_one_runs.load(Ordering::SeqCst), 1);
        // Phase one's checkpoint survives the failure.
        assert_eq!(manager.list("pipeline").await.len(), 1);

        let result = manager
            .execute("pipeline", make_phases(false, Arc::clone(&phase_one_runs)))
            .await
            .unwrap();
        assert_eq!(result, 10);
        // Phase one was not re-executed; its checkpoint fed phase two.
        assert_eq!(phase_one_runs.load(Ordering::SeqCst), 1);
        assert!(manager.list("pipeline").await.is_empty());
    }

    #[tokio::test]
    async fn resume_deletes_checkpoint_only_on_success() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let id = manager.save("op", "phase", &41u32, None).await.unwrap();

        let err = manager
            .resume::<u32, u32, _, _>(&id, |_cp| async move { anyhow::bail!("not yet") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not yet"));
        assert!(manager.load::<u32>(&id).await.is_some(), "kept for retry");

        let value = manager
            .resume::<u32, u32, _, _>(&id, |cp| async move { Ok(cp.data + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(manager.load::<u32>(&id).await.is_none());
    }

    #[tokio::test]
    async fn resume_missing_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let err = manager
            .resume::<u32, u32, _, _>("op-phase-0-000000", |cp| async move { Ok(cp.data) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
