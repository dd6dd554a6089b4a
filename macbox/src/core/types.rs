//! Flow, step and swarm records shared by the engine and its callers.
//!
//! Every type here serializes with camelCase keys so persisted result files
//! stay stable for other tools reading `.macbox/flows/`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema tag written into every persisted flow result file.
pub const FLOW_RESULT_SCHEMA: &str = "macbox.flow.result.v1";
/// Schema tag carried by swarm results.
pub const SWARM_RESULT_SCHEMA: &str = "macbox.swarm.result.v1";

/// Author-supplied description of one unit of work within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique within a flow. The project loader fills in `step-<index>` when empty.
    #[serde(default)]
    pub id: String,
    /// Selects the executor registered under this name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Executor-specific parameters. String values may contain `${steps.<id>.<path>}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl StepDefinition {
    /// Look up a string argument, ignoring non-string values.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.as_ref()?.get(key)?.as_str()
    }

    /// Look up an unsigned integer argument.
    pub fn u64_arg(&self, key: &str) -> Option<u64> {
        self.args.as_ref()?.get(key)?.as_u64()
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.args.as_ref()?.get(key)?.as_bool()
    }
}

/// Ordered list of steps. Order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub steps: Vec<StepDefinition>,
}

/// Outcome of one executed step. Created once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Populated whenever a process ran, empty when the step never executed.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Set when the executor itself could not run the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    /// Result for a step that failed before any process was spawned.
    pub fn executor_error(
        step_id: &str,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            exit_code: 1,
            stdout: None,
            stderr: None,
            outputs: BTreeMap::new(),
            error: Some(message.into()),
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// A step failed if it exited non-zero or its executor reported an error.
    pub fn failed(&self) -> bool {
        self.exit_code != 0 || self.error.is_some()
    }
}

/// Outcome of one flow run in one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub flow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// True iff every executed step succeeded.
    pub ok: bool,
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// On-disk envelope for a [`FlowResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowResultRecord {
    pub schema: String,
    #[serde(flatten)]
    pub result: FlowResult,
}

impl FlowResultRecord {
    pub fn new(result: FlowResult) -> Self {
        Self {
            schema: FLOW_RESULT_SCHEMA.to_string(),
            result,
        }
    }
}

/// One workspace's entry in a swarm result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFlowResult {
    pub workspace_id: String,
    pub flow_result: FlowResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl SwarmSummary {
    /// Count outcomes by `flow_result.ok`.
    pub fn from_results(results: &[WorkspaceFlowResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.flow_result.ok).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }
}

/// Aggregate of one flow fanned out across workspaces.
///
/// `results` follows the order of the requested workspace ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmResult {
    pub schema: String,
    pub flow_name: String,
    pub results: Vec<WorkspaceFlowResult>,
    pub summary: SwarmSummary,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SwarmResult {
    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0
    }
}
