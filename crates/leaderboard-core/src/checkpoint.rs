//! Durable checkpoint of per-task results.
//!
//! The checkpoint is a single JSON document rewritten atomically (temp file in the same
//! directory, then rename) every time a result is appended, so a crash between tasks always
//! leaves a loadable file. A sibling `<checkpoint>.lock` file keeps two evaluators off the
//! same path.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::{ExistingCheckpointPolicy, Track};
use crate::error::CheckpointError;
use crate::report::EvaluationReport;
use crate::task::{EvaluationResult, EvaluationTask};

/// Schema tag written to and required from every checkpoint file.
pub const CHECKPOINT_SCHEMA: &str = "leaderboard.checkpoint.v1";

/// Global progress marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Index into the task plan of the next task to run.
    pub next_task_index: usize,
}

/// One recorded task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub task: EvaluationTask,
    pub result: EvaluationResult,
}

/// Plan description stamped into a checkpoint when it is (re)initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub plan_digest: String,
    pub track: Track,
    pub repetitions: u32,
    pub total_tasks: usize,
}

/// On-disk checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub schema_version: String,
    pub plan_digest: String,
    pub track: Track,
    pub repetitions: u32,
    pub total_tasks: usize,
    #[serde(default)]
    pub progress: Progress,
    /// Sensor type ids declared by the agent on its first successful setup.
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Evaluator runs that touched this file, oldest first.
    #[serde(default)]
    pub runs: Vec<Uuid>,
    #[serde(default)]
    pub entries: Vec<CheckpointEntry>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_record: Option<EvaluationReport>,
}

impl CheckpointFile {
    fn fresh(header: &CheckpointHeader, run_id: Uuid) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA.to_string(),
            plan_digest: header.plan_digest.clone(),
            track: header.track,
            repetitions: header.repetitions,
            total_tasks: header.total_tasks,
            progress: Progress::default(),
            sensors: Vec::new(),
            runs: vec![run_id],
            entries: Vec::new(),
            updated_at: Utc::now(),
            global_record: None,
        }
    }

    /// Recorded results in append order.
    pub fn results(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.entries.iter().map(|e| &e.result)
    }
}

/// Read a checkpoint file. `Ok(None)` when the file does not exist.
pub fn load(path: &Path) -> Result<Option<CheckpointFile>, CheckpointError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let malformed = |reason: String| CheckpointError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?;
    let schema = value
        .get("schema_version")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| malformed("missing schema_version".into()))?;
    if schema != CHECKPOINT_SCHEMA {
        return Err(CheckpointError::IncompatibleSchema {
            path: path.to_path_buf(),
            found: schema.to_string(),
            expected: CHECKPOINT_SCHEMA.to_string(),
        });
    }

    let file: CheckpointFile =
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    let mut seen = HashSet::new();
    for entry in &file.entries {
        if entry.task != entry.result.task {
            return Err(malformed(format!(
                "entry for {} carries the result of {}",
                entry.task, entry.result.task
            )));
        }
        if !seen.insert(&entry.task) {
            return Err(malformed(format!("{} is recorded twice", entry.task)));
        }
    }
    Ok(Some(file))
}

/// Lock guarding a checkpoint path for the lifetime of a store.
#[derive(Debug)]
pub struct CheckpointLock {
    path: PathBuf,
}

impl CheckpointLock {
    /// Lock path for a checkpoint: `<checkpoint>.lock`.
    pub fn path_for(checkpoint: &Path) -> PathBuf {
        let mut name = checkpoint.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Create the lock file, failing if another evaluator holds it.
    pub fn acquire(checkpoint: &Path, run_id: Uuid) -> Result<Self, CheckpointError> {
        let path = Self::path_for(checkpoint);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(CheckpointError::Locked {
                    lock_path: path,
                    holder,
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        let holder = format!(
            "pid={} run_id={} acquired_at={}",
            std::process::id(),
            run_id,
            Utc::now().to_rfc3339()
        );
        if let Err(source) = file.write_all(holder.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(CheckpointError::Io { path, source });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove checkpoint lock");
        }
    }
}

/// Single owner of the checkpoint file for one evaluator run.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    file: CheckpointFile,
    index: HashSet<EvaluationTask>,
    resumed: usize,
    _lock: CheckpointLock,
}

impl CheckpointStore {
    /// Lock `path` and decide what to do with whatever is already there.
    ///
    /// - absent or zero entries: start fresh
    /// - `resume`: keep the entries if the plan digest matches, else [`CheckpointError::PlanMismatch`]
    /// - otherwise: apply `policy` (reject with [`CheckpointError::StaleCheckpoint`] or overwrite)
    ///
    /// `Overwrite` without `resume` also replaces a file that cannot be read (foreign schema or
    /// malformed JSON); every other mode reports it.
    ///
    /// Nothing is written until the first [`flush`](Self::flush) or [`append`](Self::append).
    pub fn open(
        path: &Path,
        header: &CheckpointHeader,
        resume: bool,
        policy: ExistingCheckpointPolicy,
        run_id: Uuid,
    ) -> Result<Self, CheckpointError> {
        let lock = CheckpointLock::acquire(path, run_id)?;

        let loaded = match load(path) {
            Err(
                e @ (CheckpointError::IncompatibleSchema { .. } | CheckpointError::Malformed { .. }),
            ) if !resume && policy == ExistingCheckpointPolicy::Overwrite => {
                tracing::warn!(
                    checkpoint = %path.display(),
                    error = %e,
                    "overwriting unreadable checkpoint"
                );
                None
            }
            other => other?,
        };

        let file = match loaded {
            None => CheckpointFile::fresh(header, run_id),
            Some(existing) if existing.entries.is_empty() => {
                tracing::debug!(checkpoint = %path.display(), "reinitializing empty checkpoint");
                CheckpointFile::fresh(header, run_id)
            }
            Some(mut existing) if resume => {
                if existing.plan_digest != header.plan_digest {
                    return Err(CheckpointError::PlanMismatch {
                        path: path.to_path_buf(),
                        found: existing.plan_digest,
                        expected: header.plan_digest.clone(),
                    });
                }
                existing.total_tasks = header.total_tasks;
                existing.global_record = None;
                existing.runs.push(run_id);
                existing
            }
            Some(existing) => match policy {
                ExistingCheckpointPolicy::Reject => {
                    return Err(CheckpointError::StaleCheckpoint {
                        path: path.to_path_buf(),
                        entries: existing.entries.len(),
                    })
                }
                ExistingCheckpointPolicy::Overwrite => {
                    tracing::warn!(
                        checkpoint = %path.display(),
                        discarded = existing.entries.len(),
                        "overwriting existing checkpoint"
                    );
                    CheckpointFile::fresh(header, run_id)
                }
            },
        };

        let index: HashSet<_> = file.entries.iter().map(|e| e.task.clone()).collect();
        let resumed = index.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
            resumed,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &CheckpointFile {
        &self.file
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.file.entries
    }

    /// Number of results that were already present when the store was opened.
    pub fn resumed_count(&self) -> usize {
        self.resumed
    }

    pub fn has(&self, task: &EvaluationTask) -> bool {
        self.index.contains(task)
    }

    /// Record a result and persist it.
    ///
    /// Returns `false` when the identical result was already recorded.
    pub fn append(&mut self, result: EvaluationResult) -> Result<bool, CheckpointError> {
        let task = result.task.clone();
        if self.index.contains(&task) {
            let same = self
                .file
                .entries
                .iter()
                .any(|e| e.task == task && e.result == result);
            if same {
                return Ok(false);
            }
            return Err(CheckpointError::DuplicateTask { task });
        }

        self.file.entries.push(CheckpointEntry {
            task: task.clone(),
            result,
        });
        self.index.insert(task);
        self.flush()?;
        Ok(true)
    }

    pub fn set_progress(&mut self, next_task_index: usize) {
        self.file.progress.next_task_index = next_task_index;
    }

    /// Remember the agent's sensor suite. Only the first call has an effect.
    pub fn record_sensors(&mut self, sensors: &[String]) {
        if self.file.sensors.is_empty() {
            self.file.sensors = sensors.to_vec();
        }
    }

    pub fn set_global_record(&mut self, report: EvaluationReport) {
        self.file.global_record = Some(report);
    }

    /// Atomically rewrite the checkpoint with the in-memory state.
    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.file.updated_at = Utc::now();
        let io_err = |source: std::io::Error| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(&self.file).map_err(|e| CheckpointError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::trace!(
            checkpoint = %self.path.display(),
            entries = self.file.entries.len(),
            "checkpoint flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{OutcomeStatus, ScoreBreakdown};
    use std::collections::BTreeMap;

    fn header(digest: &str) -> CheckpointHeader {
        CheckpointHeader {
            plan_digest: digest.into(),
            track: Track::Sensors,
            repetitions: 2,
            total_tasks: 4,
        }
    }

    fn result(route: &str, rep: u32, completion: f64) -> EvaluationResult {
        EvaluationResult {
            task: EvaluationTask::new(route, rep),
            status: OutcomeStatus::Success,
            scores: ScoreBreakdown::compute(completion, &BTreeMap::new()),
            infractions: BTreeMap::new(),
            infraction_count: 0,
            duration_ms: 1200,
            sim_time_s: 12.5,
            failure_reason: None,
            recording: None,
            attempts: 1,
            started_at: Utc::now(),
            run_id: Uuid::nil(),
        }
    }

    fn open(path: &Path, digest: &str, resume: bool) -> Result<CheckpointStore, CheckpointError> {
        CheckpointStore::open(
            path,
            &header(digest),
            resume,
            ExistingCheckpointPolicy::Reject,
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_append_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = open(&path, "abc", false).unwrap();
        assert!(!path.exists());

        assert!(store.append(result("0", 0, 100.0)).unwrap());
        let on_disk = load(&path).unwrap().unwrap();
        assert_eq!(on_disk.entries.len(), 1);
        assert_eq!(on_disk.schema_version, CHECKPOINT_SCHEMA);
        assert!(store.has(&EvaluationTask::new("0", 0)));
        assert!(!store.has(&EvaluationTask::new("0", 1)));
    }

    #[test]
    fn test_duplicate_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir.path().join("results.json"), "abc", false).unwrap();
        let first = result("0", 0, 100.0);
        store.append(first.clone()).unwrap();
        assert!(!store.append(first).unwrap());

        let err = store.append(result("0", 0, 50.0)).unwrap_err();
        assert!(matches!(err, CheckpointError::DuplicateTask { .. }));
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_lock_refuses_second_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let store = open(&path, "abc", false).unwrap();

        let err = open(&path, "abc", false).unwrap_err();
        match err {
            CheckpointError::Locked { lock_path, holder } => {
                assert_eq!(lock_path, CheckpointLock::path_for(&path));
                assert!(holder.contains("pid="));
            }
            other => panic!("expected Locked, got {other:?}"),
        }

        drop(store);
        assert!(!CheckpointLock::path_for(&path).exists());
        open(&path, "abc", false).unwrap();
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"schema_version": "leaderboard.checkpoint.v0"}"#).unwrap();
        match load(&path) {
            Err(CheckpointError::IncompatibleSchema { found, .. }) => {
                assert_eq!(found, "leaderboard.checkpoint.v0")
            }
            other => panic!("expected IncompatibleSchema, got {other:?}"),
        }

        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::Malformed { .. })));
    }

    #[test]
    fn test_resume_requires_matching_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        {
            let mut store = open(&path, "abc", false).unwrap();
            store.append(result("0", 0, 100.0)).unwrap();
        }

        let err = open(&path, "def", true).unwrap_err();
        match err {
            CheckpointError::PlanMismatch { found, expected, .. } => {
                assert_eq!(found, "abc");
                assert_eq!(expected, "def");
            }
            other => panic!("expected PlanMismatch, got {other:?}"),
        }

        let store = open(&path, "abc", true).unwrap();
        assert_eq!(store.resumed_count(), 1);
        assert_eq!(store.file().runs.len(), 2);
    }

    #[test]
    fn test_existing_checkpoint_policies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        {
            let mut store = open(&path, "abc", false).unwrap();
            store.append(result("0", 0, 100.0)).unwrap();
        }

        assert!(matches!(
            open(&path, "abc", false),
            Err(CheckpointError::StaleCheckpoint { entries: 1, .. })
        ));

        let mut store = CheckpointStore::open(
            &path,
            &header("abc"),
            false,
            ExistingCheckpointPolicy::Overwrite,
            Uuid::new_v4(),
        )
        .unwrap();
        assert!(store.entries().is_empty());
        store.flush().unwrap();
        assert!(load(&path).unwrap().unwrap().entries.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_unreadable_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let overwrite = |resume: bool| {
            CheckpointStore::open(
                &path,
                &header("abc"),
                resume,
                ExistingCheckpointPolicy::Overwrite,
                Uuid::new_v4(),
            )
        };

        fs::write(&path, r#"{"schema_version": "leaderboard.checkpoint.v0"}"#).unwrap();
        assert!(matches!(
            open(&path, "abc", false),
            Err(CheckpointError::IncompatibleSchema { .. })
        ));
        assert!(matches!(
            overwrite(true),
            Err(CheckpointError::IncompatibleSchema { .. })
        ));
        let mut store = overwrite(false).unwrap();
        store.flush().unwrap();
        drop(store);
        assert_eq!(load(&path).unwrap().unwrap().plan_digest, "abc");

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            open(&path, "abc", false),
            Err(CheckpointError::Malformed { .. })
        ));
        let mut store = overwrite(false).unwrap();
        store.flush().unwrap();
        drop(store);
        assert_eq!(load(&path).unwrap().unwrap().schema_version, CHECKPOINT_SCHEMA);
    }

    #[test]
    fn test_empty_checkpoint_reinitialized_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        {
            let mut store = open(&path, "old", false).unwrap();
            store.flush().unwrap();
        }
        let store = open(&path, "new", false).unwrap();
        assert_eq!(store.file().plan_digest, "new");
    }

    #[test]
    fn test_sensors_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir.path().join("results.json"), "abc", false).unwrap();
        store.record_sensors(&["sensor.camera.rgb".to_string()]);
        store.record_sensors(&["sensor.lidar.ray_cast".to_string()]);
        assert_eq!(store.file().sensors, vec!["sensor.camera.rgb".to_string()]);
    }
}
