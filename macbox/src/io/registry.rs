//! Workspace and session records the engine reads before running a flow.
//!
//! Only the fields the engine consumes are modelled. Each record lives in its
//! own JSON file under the macbox home.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LookupError;
use crate::io::paths::MacboxPaths;

/// A named handle to one git worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub id: String,
    pub session_id: String,
    pub worktree_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Session metadata a workspace was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub repo_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_common_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Lookup seam used by the swarm orchestrator. Shared across worker threads.
pub trait Registry: Send + Sync {
    /// Fails with [`LookupError::WorkspaceNotFound`] when absent.
    fn load_workspace(&self, workspace_id: &str) -> Result<WorkspaceRecord>;

    /// Fails with [`LookupError::SessionNotFound`] when absent.
    fn load_session(&self, session_id: &str) -> Result<SessionRecord>;

    fn workspace_exists(&self, workspace_id: &str) -> Result<bool>;

    fn save_workspace(&self, record: &WorkspaceRecord) -> Result<()>;
}

/// Registry backed by one JSON file per record.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    paths: MacboxPaths,
}

impl FileRegistry {
    pub fn new(paths: MacboxPaths) -> Self {
        Self { paths }
    }

    pub fn save_session(&self, record: &SessionRecord) -> Result<()> {
        write_record(&self.paths.session_path(&record.id)?, record)
    }
}

impl Registry for FileRegistry {
    fn load_workspace(&self, workspace_id: &str) -> Result<WorkspaceRecord> {
        let path = self.paths.workspace_path(workspace_id)?;
        read_record(&path)?
            .ok_or_else(|| LookupError::WorkspaceNotFound(workspace_id.to_string()).into())
    }

    fn load_session(&self, session_id: &str) -> Result<SessionRecord> {
        let path = self.paths.session_path(session_id)?;
        read_record(&path)?
            .ok_or_else(|| LookupError::SessionNotFound(session_id.to_string()).into())
    }

    fn workspace_exists(&self, workspace_id: &str) -> Result<bool> {
        Ok(self.paths.workspace_path(workspace_id)?.is_file())
    }

    fn save_workspace(&self, record: &WorkspaceRecord) -> Result<()> {
        write_record(&self.paths.workspace_path(&record.id)?, record)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    debug!(path = %path.display(), "loading record");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let record =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(record))
}

/// Atomically write a record (temp file + rename).
fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(record).context("serialize record")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}
