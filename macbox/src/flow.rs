//! Flow engine: runs the steps of one flow, in order, in one working directory.
//!
//! Per step the engine interpolates `args` against the results recorded so
//! far, dispatches through the [`StepRegistry`], and asks [`FlowProgress`]
//! whether to continue. Step failures are data in the returned
//! [`FlowResult`]; only fatal executor errors come back as `Err`.

use std::borrow::Cow;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::instrument;

use crate::core::flow_state::{Advance, FlowProgress};
use crate::core::interpolate::resolve_args;
use crate::core::types::{FlowDefinition, FlowResult, StepDefinition, StepResult};
use crate::events::{EngineEvent, FlowObserver, TracingObserver};
use crate::io::executor::{StepContext, StepRegistry};
use crate::io::results::persist_flow_result;

pub struct FlowEngine<'a> {
    steps: &'a StepRegistry,
    observer: &'a dyn FlowObserver,
    persist: bool,
}

impl<'a> FlowEngine<'a> {
    /// Engine that persists results and reports events through `tracing`.
    pub fn new(steps: &'a StepRegistry) -> Self {
        Self {
            steps,
            observer: &TracingObserver,
            persist: true,
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn FlowObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Toggle writing `.macbox/flows/*.json` after each run.
    pub fn persist_results(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn observer(&self) -> &'a dyn FlowObserver {
        self.observer
    }

    /// Run a declared flow. `workspace_id` is recorded in the result.
    #[instrument(skip_all, fields(flow = flow_name, workspace = ?workspace_id))]
    pub fn run_flow(
        &self,
        flow_name: &str,
        flow: &FlowDefinition,
        workspace_id: Option<&str>,
        ctx: &StepContext,
    ) -> Result<FlowResult> {
        self.run(flow_name, &flow.steps, workspace_id, ctx)
    }

    /// Run an ad-hoc step list such as a lifecycle hook. Results persist under `label`.
    #[instrument(skip_all, fields(label = label))]
    pub fn run_steps(
        &self,
        label: &str,
        steps: &[StepDefinition],
        ctx: &StepContext,
    ) -> Result<FlowResult> {
        self.run(label, steps, None, ctx)
    }

    fn run(
        &self,
        flow_name: &str,
        steps: &[StepDefinition],
        workspace_id: Option<&str>,
        ctx: &StepContext,
    ) -> Result<FlowResult> {
        let started_at = Utc::now();
        self.observer.notify(&EngineEvent::FlowStarted {
            flow_name,
            workspace_id,
            step_count: steps.len(),
        });

        let mut progress = FlowProgress::new(steps.len());
        let mut executed: Vec<StepResult> = Vec::with_capacity(steps.len());
        while let Some(index) = progress.next_index() {
            let step = prepare_step(&steps[index], index, &executed);
            self.observer.notify(&EngineEvent::StepStarted {
                flow_name,
                step_id: &step.id,
                index,
            });

            let result = self
                .steps
                .execute(&step, ctx)
                .with_context(|| format!("run step '{}' of '{flow_name}'", step.id))?;
            self.observer.notify(&EngineEvent::StepFinished {
                flow_name,
                result: &result,
            });

            let advance = progress.record(result.failed(), step.continue_on_error);
            executed.push(result);
            if advance == Advance::Halt {
                self.observer.notify(&EngineEvent::FlowHalted {
                    flow_name,
                    step_id: &step.id,
                    skipped: steps.len() - index - 1,
                });
            }
        }

        let result = FlowResult {
            flow_name: flow_name.to_string(),
            workspace_id: workspace_id.map(str::to_string),
            ok: progress.ok(),
            steps: executed,
            started_at,
            completed_at: Utc::now(),
        };
        self.observer
            .notify(&EngineEvent::FlowFinished { result: &result });

        if self.persist {
            match persist_flow_result(&result, &ctx.workdir) {
                Ok(path) => self.observer.notify(&EngineEvent::ResultPersisted {
                    flow_name,
                    path: &path,
                }),
                Err(error) => self.observer.notify(&EngineEvent::PersistFailed {
                    flow_name,
                    error: &error,
                }),
            }
        }
        Ok(result)
    }
}

/// Interpolated copy of `step`, with an id assigned when the author left it empty.
fn prepare_step<'s>(
    step: &'s StepDefinition,
    index: usize,
    prior: &[StepResult],
) -> Cow<'s, StepDefinition> {
    if step.id.is_empty() || step.args.is_some() {
        let mut owned = step.clone();
        if owned.id.is_empty() {
            owned.id = format!("step-{index}");
        }
        if let Some(args) = &step.args {
            owned.args = Some(resolve_args(args, prior));
        }
        Cow::Owned(owned)
    } else {
        Cow::Borrowed(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::MacboxConfig;
    use crate::io::results::list_flow_results;
    use crate::test_support::{RecordingObserver, shell_step, shell_step_continue};
    use std::fs;
    use std::sync::{Arc, Mutex};

    fn flow(steps: Vec<StepDefinition>) -> FlowDefinition {
        FlowDefinition { steps }
    }

    #[test]
    fn events_follow_execution_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let observer = RecordingObserver::default();
        let engine = FlowEngine::new(&registry)
            .with_observer(&observer)
            .persist_results(false);

        let result = engine
            .run_flow(
                "ci",
                &flow(vec![shell_step("a", "true"), shell_step("b", "exit 3")]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert!(!result.ok);
        assert_eq!(
            observer.events(),
            vec![
                "flow_started:ci:2",
                "step_started:a",
                "step_finished:a:0",
                "step_started:b",
                "step_finished:b:3",
                "flow_halted:b:0",
                "flow_finished:ci:false",
            ]
        );
    }

    #[test]
    fn halted_flow_reports_skipped_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let observer = RecordingObserver::default();
        let engine = FlowEngine::new(&registry)
            .with_observer(&observer)
            .persist_results(false);

        let result = engine
            .run_flow(
                "ci",
                &flow(vec![
                    shell_step("a", "exit 1"),
                    shell_step("b", "true"),
                    shell_step("c", "true"),
                ]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert_eq!(result.steps.len(), 1);
        assert!(observer.events().contains(&"flow_halted:a:2".to_string()));
    }

    #[test]
    fn continue_on_error_runs_remaining_steps_but_fails_flow() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry).persist_results(false);

        let result = engine
            .run_flow(
                "ci",
                &flow(vec![
                    shell_step_continue("a", "exit 5"),
                    shell_step("b", "echo after"),
                ]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert!(!result.ok);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].exit_code, 5);
        assert_eq!(result.steps[1].outputs["result"], "after");
    }

    #[test]
    fn self_and_future_references_resolve_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry).persist_results(false);

        let result = engine
            .run_flow(
                "refs",
                &flow(vec![
                    shell_step(
                        "a",
                        "echo \"[${steps.a.outputs.result}][${steps.b.exitCode}]\"",
                    ),
                    shell_step("b", "true"),
                ]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert_eq!(result.steps[0].outputs["result"], "[][]");
    }

    #[test]
    fn empty_ids_are_assigned_by_position() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry).persist_results(false);

        let result = engine
            .run_flow(
                "ids",
                &flow(vec![
                    shell_step("", "echo one"),
                    shell_step("", "echo ${steps.step-0.stdout}"),
                ]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert_eq!(result.steps[0].step_id, "step-0");
        assert_eq!(result.steps[1].step_id, "step-1");
        assert_eq!(result.steps[1].outputs["result"], "one");
    }

    #[test]
    fn empty_flow_succeeds_with_no_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry).persist_results(false);

        let result = engine
            .run_flow(
                "noop",
                &FlowDefinition::default(),
                Some("w1"),
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert!(result.ok);
        assert!(result.steps.is_empty());
        assert_eq!(result.workspace_id.as_deref(), Some("w1"));
    }

    #[test]
    fn run_steps_persists_under_label_without_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let observer = RecordingObserver::default();
        let engine = FlowEngine::new(&registry).with_observer(&observer);

        let result = engine
            .run_steps(
                "hook-workspaceCreate",
                &[shell_step("setup", "true")],
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert!(result.ok);
        assert_eq!(result.workspace_id, None);
        let stored = list_flow_results(temp.path()).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record.result.flow_name, "hook-workspaceCreate");
        assert!(
            observer
                .events()
                .contains(&"persisted:hook-workspaceCreate".to_string())
        );
    }

    #[test]
    fn persistence_failure_is_reported_and_swallowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A file where the results directory should be.
        fs::write(temp.path().join(".macbox"), "not a dir").expect("write");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let observer = RecordingObserver::default();
        let engine = FlowEngine::new(&registry).with_observer(&observer);

        let result = engine
            .run_flow(
                "ci",
                &flow(vec![shell_step("a", "true")]),
                None,
                &StepContext::new(temp.path()),
            )
            .expect("run");

        assert!(result.ok);
        assert!(observer.events().contains(&"persist_failed:ci".to_string()));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_engine_logs_persistence_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(".macbox"), "not a dir").expect("write");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry);
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            engine.run_flow(
                "ci",
                &flow(vec![shell_step("a", "true")]),
                None,
                &StepContext::new(temp.path()),
            )
        })
        .expect("run");

        assert!(result.ok);
        let logs = String::from_utf8(logs.0.lock().expect("log lock").clone()).expect("utf8");
        assert!(logs.contains("could not write flow result"), "logs: {logs}");
    }

    #[test]
    fn missing_workdir_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&registry).persist_results(false);

        let err = engine
            .run_flow(
                "ci",
                &flow(vec![shell_step("a", "true")]),
                None,
                &StepContext::new(temp.path().join("gone")),
            )
            .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("run step 'a' of 'ci'"));
        assert!(message.contains("does not exist"));
    }
}
