//! Canonical locations under the macbox home and inside a workspace.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};

/// Environment variable that overrides the macbox home directory.
pub const HOME_ENV: &str = "MACBOX_HOME";

/// All canonical paths within the macbox home.
#[derive(Debug, Clone)]
pub struct MacboxPaths {
    pub home: PathBuf,
    pub config_path: PathBuf,
    pub workspaces_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl MacboxPaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            config_path: home.join("config.toml"),
            workspaces_dir: home.join("workspaces"),
            sessions_dir: home.join("sessions"),
            worktrees_dir: home.join("worktrees"),
            home,
        }
    }

    /// `$MACBOX_HOME`, else `~/.macbox`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(home));
        }
        let user_home =
            dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::new(user_home.join(".macbox")))
    }

    pub fn workspace_path(&self, workspace_id: &str) -> Result<PathBuf> {
        validate_record_id(workspace_id)?;
        Ok(self.workspaces_dir.join(format!("{workspace_id}.json")))
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_record_id(session_id)?;
        Ok(self.sessions_dir.join(format!("{session_id}.json")))
    }

    /// Checkout location for a workspace created from `session_id`.
    pub fn worktree_path(&self, session_id: &str, workspace_id: &str) -> Result<PathBuf> {
        validate_record_id(session_id)?;
        validate_record_id(workspace_id)?;
        Ok(self.worktrees_dir.join(session_id).join(workspace_id))
    }
}

/// Workspace and session ids name files directly, so they must stay a single
/// path component.
pub fn validate_record_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        bail!("invalid id '{id}': must be a single path component");
    }
    Ok(())
}

/// Directory holding persisted flow results for a working directory.
pub fn flow_results_dir(workdir: &Path) -> PathBuf {
    workdir.join(".macbox").join("flows")
}

/// Project config declaring flows and hooks.
pub fn project_config_path(repo_root: &Path) -> PathBuf {
    repo_root.join("macbox.json")
}
