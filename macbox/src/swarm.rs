//! Swarm orchestration: one flow fanned out across many workspaces.
//!
//! Workspaces are claimed from a shared cursor by a fixed number of scoped
//! worker threads. Results land in per-index slots, so the output order is the
//! request order no matter which worker finishes first.
//!
//! The first task error stops further claims and is returned to the caller;
//! results of tasks that had not finished are discarded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::core::types::{
    FlowDefinition, SWARM_RESULT_SCHEMA, SwarmResult, SwarmSummary, WorkspaceFlowResult,
};
use crate::events::EngineEvent;
use crate::flow::FlowEngine;
use crate::io::executor::StepContext;
use crate::io::registry::Registry;

/// Run `task` over `items` with at most `limit` concurrent workers.
///
/// Output order matches `items`. A `limit` of zero is treated as one. The
/// first error wins; workers stop claiming once it is recorded. A panicking
/// task panics the caller once all workers have stopped.
pub fn run_with_limit<I, T, F>(items: &[I], limit: usize, task: F) -> Result<Vec<T>>
where
    I: Sync,
    T: Send + Sync,
    F: Fn(usize, &I) -> Result<T> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = limit.clamp(1, items.len());
    let cursor = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let slots: Vec<OnceLock<T>> = items.iter().map(|_| OnceLock::new()).collect();

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                while !abort.load(Ordering::Acquire) {
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(index) else {
                        break;
                    };
                    match task(index, item) {
                        Ok(value) => {
                            // Each index is claimed exactly once.
                            let _ = slots[index].set(value);
                        }
                        Err(err) => {
                            abort.store(true, Ordering::Release);
                            let mut slot =
                                first_error.lock().unwrap_or_else(PoisonError::into_inner);
                            slot.get_or_insert(err);
                            break;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = first_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        return Err(err);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.into_inner()
                .ok_or_else(|| anyhow!("task {index} finished without a result"))
        })
        .collect()
}

/// Settings layered over every workspace's session-derived context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmOverrides {
    pub env: BTreeMap<String, String>,
    pub profiles: Vec<String>,
    pub capabilities: Vec<String>,
    /// Replaces the session's agent kind.
    pub agent: Option<String>,
}

impl SwarmOverrides {
    pub fn apply(&self, ctx: &mut StepContext) {
        ctx.env
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        append_unique(&mut ctx.profiles, &self.profiles);
        append_unique(&mut ctx.capabilities, &self.capabilities);
        if let Some(agent) = &self.agent {
            ctx.agent_kind = Some(agent.clone());
        }
    }
}

fn append_unique(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Runs flows across registered workspaces.
pub struct SwarmOrchestrator<'a> {
    engine: &'a FlowEngine<'a>,
    registry: &'a dyn Registry,
}

impl<'a> SwarmOrchestrator<'a> {
    pub fn new(engine: &'a FlowEngine<'a>, registry: &'a dyn Registry) -> Self {
        Self { engine, registry }
    }

    /// Run `flow` in every workspace of `workspace_ids`, `max_parallel` at a time.
    ///
    /// A missing workspace or session record aborts the whole swarm.
    #[instrument(skip_all, fields(flow = flow_name, workspaces = workspace_ids.len(), max_parallel = max_parallel))]
    pub fn run_swarm(
        &self,
        flow_name: &str,
        flow: &FlowDefinition,
        workspace_ids: &[String],
        max_parallel: usize,
        overrides: &SwarmOverrides,
    ) -> Result<SwarmResult> {
        let started_at = Utc::now();
        let observer = self.engine.observer();

        let results = run_with_limit(workspace_ids, max_parallel, |index, workspace_id| {
            observer.notify(&EngineEvent::WorkspaceStarted {
                workspace_id,
                index,
            });
            let ctx = self
                .workspace_context(workspace_id, overrides)
                .with_context(|| format!("prepare workspace '{workspace_id}'"))?;
            let flow_result = self
                .engine
                .run_flow(flow_name, flow, Some(workspace_id.as_str()), &ctx)
                .with_context(|| format!("run '{flow_name}' in workspace '{workspace_id}'"))?;
            observer.notify(&EngineEvent::WorkspaceFinished {
                workspace_id,
                ok: flow_result.ok,
            });
            Ok(WorkspaceFlowResult {
                workspace_id: workspace_id.clone(),
                flow_result,
            })
        })?;

        let summary = SwarmSummary::from_results(&results);
        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "swarm finished"
        );
        Ok(SwarmResult {
            schema: SWARM_RESULT_SCHEMA.to_string(),
            flow_name: flow_name.to_string(),
            results,
            summary,
            started_at,
            completed_at: Utc::now(),
        })
    }

    fn workspace_context(
        &self,
        workspace_id: &str,
        overrides: &SwarmOverrides,
    ) -> Result<StepContext> {
        let workspace = self.registry.load_workspace(workspace_id)?;
        let session = self.registry.load_session(&workspace.session_id)?;
        let mut ctx = StepContext::for_workspace(&workspace, &session);
        overrides.apply(&mut ctx);
        Ok(ctx)
    }
}
