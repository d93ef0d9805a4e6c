//! Persistent loop checkpoints
//!
//! Each stateful loop is checkpointed to `<state_dir>/<key>.state.json`.
//! Before a checkpoint is overwritten the previous file is rotated into
//! `.1`, `.2`, `.3` backups so a corrupt write never loses everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of rotated backups kept per loop
pub const BACKUP_COUNT: usize = 3;

const STATE_SUFFIX: &str = ".state.json";

#[derive(Debug, Error)]
pub enum LoopStateError {
    #[error("no saved state for loop '{loop_name}'")]
    NotFound { loop_name: String },

    #[error("corrupt loop state {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error(
        "workflow file changed since loop '{loop_name}' was checkpointed (expected {expected}, found {actual})"
    )]
    ChecksumMismatch {
        loop_name: String,
        expected: String,
        actual: String,
    },

    #[error("loop state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize loop state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LoopStateError {
    fn io(path: &Path, source: io::Error) -> Self {
        LoopStateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Lifecycle of a checkpointed loop
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Completed => "completed",
            LoopStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One recorded iteration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub index: u32,
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

/// Checkpointed runtime state of one loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopState {
    pub loop_name: String,
    pub workflow: String,

    /// Workflow file the loop came from, if it was loaded from disk
    #[serde(default)]
    pub workflow_file: Option<PathBuf>,

    /// SHA-256 of the workflow file at checkpoint time
    #[serde(default)]
    pub workflow_checksum: String,

    pub iteration: u32,
    pub status: LoopStatus,

    #[serde(default)]
    pub initial_input: String,

    #[serde(default)]
    pub previous_output: String,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Variable store snapshot
    #[serde(default)]
    pub variables: HashMap<String, String>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    pub fn new(loop_name: impl Into<String>, workflow: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            loop_name: loop_name.into(),
            workflow: workflow.into(),
            workflow_file: None,
            workflow_checksum: String::new(),
            iteration: 0,
            status: LoopStatus::Running,
            initial_input: String::new(),
            previous_output: String::new(),
            history: Vec::new(),
            variables: HashMap::new(),
            started_at: now,
            updated_at: now,
        }
    }
}

/// SHA-256 of a workflow file, hex encoded
pub fn compute_workflow_checksum(path: &Path) -> Result<String, LoopStateError> {
    let bytes = std::fs::read(path).map_err(|e| LoopStateError::io(path, e))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Check that the workflow file a state was saved from is unchanged
pub fn validate_workflow_checksum(state: &LoopState) -> Result<(), LoopStateError> {
    let Some(ref path) = state.workflow_file else {
        return Ok(());
    };
    let actual = compute_workflow_checksum(path)?;
    if actual != state.workflow_checksum {
        return Err(LoopStateError::ChecksumMismatch {
            loop_name: state.loop_name.clone(),
            expected: state.workflow_checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Reads and writes loop checkpoints in one directory
#[derive(Debug, Clone)]
pub struct LoopStateManager {
    dir: PathBuf,
}

impl LoopStateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the primary checkpoint for a loop key
    pub fn state_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_key(key), STATE_SUFFIX))
    }

    /// Path of the n-th backup (1 is the newest)
    pub fn backup_path(&self, key: &str, n: usize) -> PathBuf {
        self.dir
            .join(format!("{}{}.{}", file_key(key), STATE_SUFFIX, n))
    }

    /// Rotate backups, then write the state atomically
    pub fn save_state(&self, key: &str, state: &LoopState) -> Result<(), LoopStateError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| LoopStateError::io(&self.dir, e))?;

        let path = self.state_path(key);
        if path.exists() {
            self.rotate_backups(key)?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| LoopStateError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| LoopStateError::io(&path, e))?;

        tracing::debug!(
            loop_name = %state.loop_name,
            iteration = state.iteration,
            status = %state.status,
            path = %path.display(),
            "saved loop state"
        );
        Ok(())
    }

    fn rotate_backups(&self, key: &str) -> Result<(), LoopStateError> {
        let oldest = self.backup_path(key, BACKUP_COUNT);
        if oldest.exists() {
            std::fs::remove_file(&oldest).map_err(|e| LoopStateError::io(&oldest, e))?;
        }
        for n in (1..BACKUP_COUNT).rev() {
            let from = self.backup_path(key, n);
            if from.exists() {
                let to = self.backup_path(key, n + 1);
                std::fs::rename(&from, &to).map_err(|e| LoopStateError::io(&from, e))?;
            }
        }
        let current = self.state_path(key);
        let newest = self.backup_path(key, 1);
        std::fs::copy(&current, &newest).map_err(|e| LoopStateError::io(&current, e))?;
        Ok(())
    }

    /// Load the primary checkpoint for a loop key
    pub fn load_state(&self, key: &str) -> Result<LoopState, LoopStateError> {
        let path = self.state_path(key);
        if !path.exists() {
            return Err(LoopStateError::NotFound {
                loop_name: key.to_string(),
            });
        }
        read_state(&path)
    }

    /// Remove a checkpoint and its backups; missing files are fine
    pub fn delete_state(&self, key: &str) -> Result<(), LoopStateError> {
        let mut paths = vec![self.state_path(key)];
        paths.extend((1..=BACKUP_COUNT).map(|n| self.backup_path(key, n)));
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(LoopStateError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Every readable checkpoint, most recently updated first
    pub fn list_states(&self) -> Result<Vec<LoopState>, LoopStateError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LoopStateError::io(&self.dir, e)),
        };

        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LoopStateError::io(&self.dir, e))?;
            let path = entry.path();
            let is_state = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(STATE_SUFFIX));
            if !is_state {
                continue;
            }
            match read_state(&path) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable loop state"),
            }
        }

        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}

fn read_state(path: &Path) -> Result<LoopState, LoopStateError> {
    let content = std::fs::read_to_string(path).map_err(|e| LoopStateError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| LoopStateError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Loop keys become file names; keep them to a safe alphabet
fn file_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_at(iteration: u32) -> LoopState {
        let mut state = LoopState::new("review", "wf");
        state.iteration = iteration;
        state.previous_output = format!("output {}", iteration);
        state
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path().join("state"));

        let mut state = state_at(2);
        state.history.push(HistoryEntry {
            index: 1,
            output: "first".into(),
            timestamp: Utc::now(),
        });
        state.variables.insert("X".into(), "1".into());
        manager.save_state("wf.review", &state).unwrap();

        let loaded = manager.load_state("wf.review").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_backup_rotation_keeps_three() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path());

        for i in 1..=4 {
            manager.save_state("loop", &state_at(i)).unwrap();
        }

        assert_eq!(manager.load_state("loop").unwrap().iteration, 4);
        for n in 1..=BACKUP_COUNT {
            assert!(manager.backup_path("loop", n).exists());
        }
        assert!(!manager.backup_path("loop", 4).exists());

        let newest = read_state(&manager.backup_path("loop", 1)).unwrap();
        let oldest = read_state(&manager.backup_path("loop", 3)).unwrap();
        assert_eq!(newest.iteration, 3);
        assert_eq!(oldest.iteration, 1);

        manager.save_state("loop", &state_at(5)).unwrap();
        let oldest = read_state(&manager.backup_path("loop", 3)).unwrap();
        assert_eq!(oldest.iteration, 2);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path());

        assert!(matches!(
            manager.load_state("nothing"),
            Err(LoopStateError::NotFound { .. })
        ));

        std::fs::write(manager.state_path("broken"), "{not json").unwrap();
        assert!(matches!(
            manager.load_state("broken"),
            Err(LoopStateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_delete_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path());
        manager.delete_state("never-saved").unwrap();

        manager.save_state("loop", &state_at(1)).unwrap();
        manager.save_state("loop", &state_at(2)).unwrap();
        manager.delete_state("loop").unwrap();
        assert!(!manager.state_path("loop").exists());
        assert!(!manager.backup_path("loop", 1).exists());
    }

    #[test]
    fn test_list_sorted_and_skips_corrupt() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path());

        let mut old = LoopState::new("old", "wf");
        old.updated_at = Utc::now() - chrono::Duration::hours(1);
        manager.save_state("old", &old).unwrap();
        manager.save_state("new", &LoopState::new("new", "wf")).unwrap();
        std::fs::write(manager.state_path("junk"), "garbage").unwrap();

        let names: Vec<_> = manager
            .list_states()
            .unwrap()
            .into_iter()
            .map(|s| s.loop_name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path().join("absent"));
        assert!(manager.list_states().unwrap().is_empty());
    }

    #[test]
    fn test_checksum_detects_change() {
        let dir = TempDir::new().unwrap();
        let wf = dir.path().join("wf.toml");
        std::fs::write(&wf, "name = \"wf\"\n").unwrap();

        let mut state = LoopState::new("loop", "wf");
        state.workflow_file = Some(wf.clone());
        state.workflow_checksum = compute_workflow_checksum(&wf).unwrap();
        assert_eq!(state.workflow_checksum.len(), 64);
        validate_workflow_checksum(&state).unwrap();

        std::fs::write(&wf, "name = \"changed\"\n").unwrap();
        assert!(matches!(
            validate_workflow_checksum(&state),
            Err(LoopStateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_file_key_is_sanitized() {
        assert_eq!(file_key("wf.review"), "wf.review");
        assert_eq!(file_key("my wf/loop"), "my_wf_loop");
    }
}
