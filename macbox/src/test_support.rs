//! Test-only helpers: step builders, git fixtures and in-memory collaborators.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::Result;
use serde_json::Value;

use crate::core::types::StepDefinition;
use crate::error::LookupError;
use crate::events::{EngineEvent, FlowObserver};
use crate::io::registry::{Registry, SessionRecord, WorkspaceRecord};

/// Step of any kind with JSON args (`Value::Null` for none).
pub fn step(id: &str, kind: &str, args: Value) -> StepDefinition {
    let args = match args {
        Value::Object(map) => Some(map),
        _ => None,
    };
    StepDefinition {
        id: id.to_string(),
        kind: kind.to_string(),
        args,
        continue_on_error: false,
    }
}

/// `shell` step running `cmd`.
pub fn shell_step(id: &str, cmd: &str) -> StepDefinition {
    step(id, "shell", serde_json::json!({ "cmd": cmd }))
}

/// `shell` step with `continueOnError` set.
pub fn shell_step_continue(id: &str, cmd: &str) -> StepDefinition {
    StepDefinition {
        continue_on_error: true,
        ..shell_step(id, cmd)
    }
}

/// Initialize a git repository at `path` with one commit containing `README.md`.
pub fn init_git_repo(path: &Path) {
    fs::create_dir_all(path).expect("create repo dir");
    git(path, &["init", "-q"]);
    git(path, &["config", "user.email", "test@example.com"]);
    git(path, &["config", "user.name", "Test"]);
    git(path, &["config", "commit.gpgsign", "false"]);
    fs::write(path.join("README.md"), "# fixture\n").expect("write README");
    git(path, &["add", "README.md"]);
    git(path, &["commit", "-q", "-m", "init"]);
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {} failed", args.join(" "));
}

/// Registry held in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    workspaces: Mutex<BTreeMap<String, WorkspaceRecord>>,
    sessions: Mutex<BTreeMap<String, SessionRecord>>,
}

impl MemoryRegistry {
    pub fn insert_workspace(&self, record: WorkspaceRecord) {
        self.workspaces
            .lock()
            .expect("workspaces lock")
            .insert(record.id.clone(), record);
    }

    pub fn insert_session(&self, record: SessionRecord) {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(record.id.clone(), record);
    }
}

impl Registry for MemoryRegistry {
    fn load_workspace(&self, workspace_id: &str) -> Result<WorkspaceRecord> {
        self.workspaces
            .lock()
            .expect("workspaces lock")
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| LookupError::WorkspaceNotFound(workspace_id.to_string()).into())
    }

    fn load_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .get(session_id)
            .cloned()
            .ok_or_else(|| LookupError::SessionNotFound(session_id.to_string()).into())
    }

    fn workspace_exists(&self, workspace_id: &str) -> Result<bool> {
        Ok(self
            .workspaces
            .lock()
            .expect("workspaces lock")
            .contains_key(workspace_id))
    }

    fn save_workspace(&self, record: &WorkspaceRecord) -> Result<()> {
        self.insert_workspace(record.clone());
        Ok(())
    }
}

/// Observer that keeps a compact text log of every event.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }
}

impl FlowObserver for RecordingObserver {
    fn notify(&self, event: &EngineEvent<'_>) {
        let line = match event {
            EngineEvent::FlowStarted {
                flow_name,
                step_count,
                ..
            } => format!("flow_started:{flow_name}:{step_count}"),
            EngineEvent::StepStarted { step_id, .. } => format!("step_started:{step_id}"),
            EngineEvent::StepFinished { result, .. } => {
                format!("step_finished:{}:{}", result.step_id, result.exit_code)
            }
            EngineEvent::FlowHalted {
                step_id, skipped, ..
            } => format!("flow_halted:{step_id}:{skipped}"),
            EngineEvent::FlowFinished { result } => {
                format!("flow_finished:{}:{}", result.flow_name, result.ok)
            }
            EngineEvent::ResultPersisted { flow_name, .. } => format!("persisted:{flow_name}"),
            EngineEvent::PersistFailed { flow_name, .. } => format!("persist_failed:{flow_name}"),
            EngineEvent::WorkspaceStarted { workspace_id, .. } => {
                format!("workspace_started:{workspace_id}")
            }
            EngineEvent::WorkspaceFinished { workspace_id, ok } => {
                format!("workspace_finished:{workspace_id}:{ok}")
            }
        };
        self.events.lock().expect("events lock").push(line);
    }
}
