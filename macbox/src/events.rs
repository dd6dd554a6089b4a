//! Engine events and the observers that receive them.
//!
//! The flow engine and swarm orchestrator never print. They report progress
//! and swallowed failures through a [`FlowObserver`] chosen by the caller.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::core::types::{FlowResult, StepResult};

/// Something the engine wants an operator to know about.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    FlowStarted {
        flow_name: &'a str,
        workspace_id: Option<&'a str>,
        step_count: usize,
    },
    StepStarted {
        flow_name: &'a str,
        step_id: &'a str,
        index: usize,
    },
    StepFinished {
        flow_name: &'a str,
        result: &'a StepResult,
    },
    /// A failed step without `continueOnError` stopped the run.
    FlowHalted {
        flow_name: &'a str,
        step_id: &'a str,
        skipped: usize,
    },
    FlowFinished {
        result: &'a FlowResult,
    },
    ResultPersisted {
        flow_name: &'a str,
        path: &'a Path,
    },
    /// Writing the result file failed. The run itself is unaffected.
    PersistFailed {
        flow_name: &'a str,
        error: &'a anyhow::Error,
    },
    /// A swarm worker claimed the workspace at `index` of the request.
    WorkspaceStarted {
        workspace_id: &'a str,
        index: usize,
    },
    WorkspaceFinished {
        workspace_id: &'a str,
        ok: bool,
    },
}

/// Receives engine events. Called from swarm worker threads concurrently.
pub trait FlowObserver: Send + Sync {
    fn notify(&self, event: &EngineEvent<'_>);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl FlowObserver for TracingObserver {
    fn notify(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::FlowStarted {
                flow_name,
                workspace_id,
                step_count,
            } => info!(flow = flow_name, workspace = ?workspace_id, step_count, "flow started"),
            EngineEvent::StepStarted {
                flow_name,
                step_id,
                index,
            } => debug!(flow = flow_name, step = step_id, index, "step started"),
            EngineEvent::StepFinished { flow_name, result } => {
                if result.failed() {
                    warn!(
                        flow = flow_name,
                        step = %result.step_id,
                        exit_code = result.exit_code,
                        error = ?result.error,
                        "step failed"
                    );
                } else {
                    debug!(flow = flow_name, step = %result.step_id, "step succeeded");
                }
            }
            EngineEvent::FlowHalted {
                flow_name,
                step_id,
                skipped,
            } => warn!(flow = flow_name, step = step_id, skipped, "flow halted"),
            EngineEvent::FlowFinished { result } => info!(
                flow = %result.flow_name,
                workspace = ?result.workspace_id,
                ok = result.ok,
                steps = result.steps.len(),
                "flow finished"
            ),
            EngineEvent::ResultPersisted { flow_name, path } => {
                debug!(flow = flow_name, path = %path.display(), "flow result written");
            }
            EngineEvent::PersistFailed { flow_name, error } => {
                warn!(flow = flow_name, err = %format!("{error:#}"), "could not write flow result");
            }
            EngineEvent::WorkspaceStarted {
                workspace_id,
                index,
            } => debug!(workspace = workspace_id, index, "workspace claimed"),
            EngineEvent::WorkspaceFinished { workspace_id, ok } => {
                info!(workspace = workspace_id, ok, "workspace finished");
            }
        }
    }
}
