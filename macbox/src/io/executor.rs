//! Step executors and the registry that dispatches on `step.type`.
//!
//! Ordinary failures (non-zero exit, missing argument, unknown type) come back
//! as data in the [`StepResult`]. `Err` is reserved for conditions that make
//! running anything pointless, such as a vanished working directory or a shell
//! binary that cannot be spawned.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::types::{StepDefinition, StepResult};
use crate::io::config::MacboxConfig;
use crate::io::git::{Git, parse_status};
use crate::io::process::{CommandOutput, run_command};
use crate::io::registry::{SessionRecord, WorkspaceRecord};

pub const SHELL_STEP: &str = "shell";
pub const GIT_STATUS_STEP: &str = "git.status";
pub const GIT_DIFF_STEP: &str = "git.diff";

/// Where and how a step runs. Supplied by the flow engine for every step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContext {
    pub workdir: PathBuf,
    pub repo_root: PathBuf,
    pub workspace_id: Option<String>,
    pub agent_kind: Option<String>,
    pub profiles: Vec<String>,
    pub capabilities: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl StepContext {
    /// Context for a plain directory that is its own repository root.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            repo_root: workdir.clone(),
            workdir,
            ..Self::default()
        }
    }

    /// Context for a registered workspace: its worktree plus the session's metadata.
    pub fn for_workspace(workspace: &WorkspaceRecord, session: &SessionRecord) -> Self {
        Self {
            workdir: workspace.worktree_path.clone(),
            repo_root: session.repo_root.clone(),
            workspace_id: Some(workspace.id.clone()),
            agent_kind: session.agent_kind.clone(),
            profiles: session.profiles.clone(),
            capabilities: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Environment handed to process steps. Explicit `env` entries win.
    pub fn env_overlay(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "MACBOX_WORKDIR".to_string(),
            self.workdir.display().to_string(),
        );
        vars.insert(
            "MACBOX_REPO_ROOT".to_string(),
            self.repo_root.display().to_string(),
        );
        if let Some(id) = &self.workspace_id {
            vars.insert("MACBOX_WORKSPACE_ID".to_string(), id.clone());
        }
        if let Some(agent) = &self.agent_kind {
            vars.insert("MACBOX_AGENT".to_string(), agent.clone());
        }
        if !self.profiles.is_empty() {
            vars.insert("MACBOX_PROFILES".to_string(), self.profiles.join(","));
        }
        if !self.capabilities.is_empty() {
            vars.insert("MACBOX_CAPABILITIES".to_string(), self.capabilities.join(","));
        }
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn ensure_workdir(&self) -> Result<()> {
        if !self.workdir.is_dir() {
            bail!("working directory {} does not exist", self.workdir.display());
        }
        Ok(())
    }
}

/// Resource bounds applied to every process a step spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl ProcessLimits {
    pub fn from_config(cfg: &MacboxConfig) -> Self {
        Self {
            timeout: cfg.step_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// `args.timeoutSecs` overrides the configured deadline; `0` disables it.
    fn timeout_for(&self, step: &StepDefinition) -> Option<Duration> {
        match step.u64_arg("timeoutSecs") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.timeout,
        }
    }
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self::from_config(&MacboxConfig::default())
    }
}

/// One step kind. Receives the step with its arguments already interpolated.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepResult>;
}

/// Explicit table of step kinds, keyed by `step.type`.
#[derive(Default)]
pub struct StepRegistry {
    executors: BTreeMap<String, Box<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Registry with no step kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// `shell`, `git.status` and `git.diff`, bounded by `cfg`.
    pub fn builtin(cfg: &MacboxConfig) -> Self {
        let limits = ProcessLimits::from_config(cfg);
        let mut registry = Self::new();
        registry
            .register(
                SHELL_STEP,
                ShellExecutor {
                    shell: cfg.shell.clone(),
                    limits,
                },
            )
            .register(GIT_STATUS_STEP, GitStatusExecutor { limits })
            .register(GIT_DIFF_STEP, GitDiffExecutor { limits });
        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        executor: impl StepExecutor + 'static,
    ) -> &mut Self {
        self.executors.insert(kind.into(), Box::new(executor));
        self
    }

    /// Dispatch to the executor registered for `step.kind`.
    ///
    /// Unknown kinds produce an error result without spawning anything.
    #[instrument(skip_all, fields(step_id = %step.id, kind = %step.kind))]
    pub fn execute(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepResult> {
        match self.executors.get(&step.kind) {
            Some(executor) => executor.execute(step, ctx),
            None => {
                debug!("unknown step type");
                Ok(StepResult::executor_error(
                    &step.id,
                    format!("unknown step type: {}", step.kind),
                    Utc::now(),
                ))
            }
        }
    }
}

/// Runs `args.cmd` as one shell invocation in the working directory.
pub struct ShellExecutor {
    pub shell: Vec<String>,
    pub limits: ProcessLimits,
}

impl StepExecutor for ShellExecutor {
    fn execute(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepResult> {
        let started_at = Utc::now();
        let Some(script) = step.str_arg("cmd") else {
            return Ok(StepResult::executor_error(
                &step.id,
                "shell step requires string arg 'cmd'",
                started_at,
            ));
        };
        let Some((program, leading)) = self.shell.split_first() else {
            bail!("shell command is empty");
        };
        ctx.ensure_workdir()?;

        let mut cmd = Command::new(program);
        cmd.args(leading).arg(script);
        prepare(&mut cmd, ctx);
        run_process_step(step, cmd, &self.limits, started_at, |_, _| {})
    }
}

/// `git status --porcelain=v1`, publishing `clean` and `count` alongside `result`.
pub struct GitStatusExecutor {
    pub limits: ProcessLimits,
}

impl StepExecutor for GitStatusExecutor {
    fn execute(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepResult> {
        let started_at = Utc::now();
        ctx.ensure_workdir()?;
        let mut cmd = Git::new(&ctx.workdir).command(["status", "--porcelain=v1", "-uall"]);
        prepare(&mut cmd, ctx);
        run_process_step(step, cmd, &self.limits, started_at, |output, outputs| {
            if output.exit_code() == 0 {
                publish_status(&output.stdout_text(), outputs);
            }
        })
    }
}

/// Add `clean` and `count` for porcelain `text`. Unparseable output adds neither.
fn publish_status(text: &str, outputs: &mut BTreeMap<String, String>) {
    match parse_status(text) {
        Ok(entries) => {
            outputs.insert("clean".to_string(), entries.is_empty().to_string());
            outputs.insert("count".to_string(), entries.len().to_string());
        }
        Err(err) => warn!(err = %format!("{err:#}"), "unparseable git status output"),
    }
}

/// `git diff [--stat] [<base>]`.
pub struct GitDiffExecutor {
    pub limits: ProcessLimits,
}

impl StepExecutor for GitDiffExecutor {
    fn execute(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepResult> {
        let started_at = Utc::now();
        ctx.ensure_workdir()?;
        let mut args = vec!["diff".to_string()];
        if step.bool_arg("stat").unwrap_or(false) {
            args.push("--stat".to_string());
        }
        if let Some(base) = step.str_arg("base").filter(|b| !b.is_empty()) {
            args.push(base.to_string());
        }
        let mut cmd = Git::new(&ctx.workdir).command(&args);
        prepare(&mut cmd, ctx);
        run_process_step(step, cmd, &self.limits, started_at, |_, _| {})
    }
}

fn prepare(cmd: &mut Command, ctx: &StepContext) {
    cmd.current_dir(&ctx.workdir).envs(ctx.env_overlay());
}

/// Spawn `cmd` and shape its output into a result.
///
/// `outputs.result` is always the trimmed stdout; `publish` may add more keys.
fn run_process_step(
    step: &StepDefinition,
    cmd: Command,
    limits: &ProcessLimits,
    started_at: DateTime<Utc>,
    publish: impl FnOnce(&CommandOutput, &mut BTreeMap<String, String>),
) -> Result<StepResult> {
    let timeout = limits.timeout_for(step);
    let output = run_command(cmd, timeout, limits.output_limit_bytes)?;
    let stdout = output.stdout_text();

    let mut outputs = BTreeMap::new();
    outputs.insert("result".to_string(), stdout.trim().to_string());
    publish(&output, &mut outputs);

    let error = match (output.timed_out, timeout) {
        (true, Some(limit)) => Some(format!("step timed out after {}s", limit.as_secs())),
        _ => None,
    };
    debug!(step_id = %step.id, exit_code = output.exit_code(), "process step finished");
    Ok(StepResult {
        step_id: step.id.clone(),
        exit_code: output.exit_code(),
        stdout: Some(stdout),
        stderr: Some(output.stderr_text()),
        outputs,
        error,
        started_at,
        completed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_git_repo, shell_step, step};
    use serde_json::json;
    use std::fs;

    fn registry() -> StepRegistry {
        StepRegistry::builtin(&MacboxConfig::default())
    }

    #[test]
    fn shell_captures_output_and_publishes_trimmed_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = StepContext::new(temp.path());
        let result = registry()
            .execute(&shell_step("hello", "echo '  hi  '"), &ctx)
            .expect("execute");

        assert_eq!(result.step_id, "hello");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.as_deref(), Some("  hi  \n"));
        assert_eq!(result.outputs.get("result").map(String::as_str), Some("hi"));
        assert_eq!(result.error, None);
    }

    #[test]
    fn shell_failure_still_publishes_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = StepContext::new(temp.path());
        let result = registry()
            .execute(&shell_step("fail", "echo partial; echo oops >&2; exit 42"), &ctx)
            .expect("execute");

        assert_eq!(result.exit_code, 42);
        assert_eq!(result.outputs.get("result").map(String::as_str), Some("partial"));
        assert_eq!(result.stderr.as_deref(), Some("oops\n"));
        assert_eq!(result.error, None);
    }

    #[test]
    fn shell_runs_in_workdir_with_env_overlay() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker.txt"), "here").expect("marker");
        let mut ctx = StepContext::new(temp.path());
        ctx.workspace_id = Some("w7".to_string());
        ctx.profiles = vec!["net".to_string(), "gpu".to_string()];
        ctx.env.insert("GREETING".to_string(), "hola".to_string());

        let result = registry()
            .execute(
                &shell_step(
                    "env",
                    "cat marker.txt; echo \" $GREETING $MACBOX_WORKSPACE_ID $MACBOX_PROFILES\"",
                ),
                &ctx,
            )
            .expect("execute");
        assert_eq!(
            result.outputs.get("result").map(String::as_str),
            Some("here hola w7 net,gpu")
        );
    }

    #[test]
    fn missing_cmd_is_an_error_result_without_a_process() {
        let ctx = StepContext::new("/definitely/missing/dir");
        let result = registry()
            .execute(&step("nocmd", SHELL_STEP, json!({"command": "echo"})), &ctx)
            .expect("execute");

        assert_eq!(result.exit_code, 1);
        assert_eq!(
            result.error.as_deref(),
            Some("shell step requires string arg 'cmd'")
        );
        assert!(result.outputs.is_empty());
        assert!(result.stdout.is_none());
    }

    #[test]
    fn unknown_type_never_spawns() {
        let ctx = StepContext::new("/definitely/missing/dir");
        let result = registry()
            .execute(&step("x", "teleport", json!({"cmd": "echo hi"})), &ctx)
            .expect("execute");

        assert_eq!(result.error.as_deref(), Some("unknown step type: teleport"));
        assert!(result.outputs.is_empty());
        assert!(result.failed());
    }

    #[test]
    fn vanished_workdir_is_fatal() {
        let ctx = StepContext::new("/definitely/missing/dir");
        let err = registry()
            .execute(&shell_step("a", "echo hi"), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn step_timeout_reports_124_and_keeps_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = StepContext::new(temp.path());
        let started = std::time::Instant::now();
        let result = registry()
            .execute(
                &step(
                    "slow",
                    SHELL_STEP,
                    json!({"cmd": "echo begun; sleep 8; echo done", "timeoutSecs": 1}),
                ),
                &ctx,
            )
            .expect("execute");

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.error.as_deref(), Some("step timed out after 1s"));
        assert_eq!(result.outputs.get("result").map(String::as_str), Some("begun"));
    }

    #[test]
    fn git_status_reports_clean_and_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_git_repo(temp.path());
        let ctx = StepContext::new(temp.path());
        let registry = registry();

        let clean = registry
            .execute(&step("st", GIT_STATUS_STEP, json!({})), &ctx)
            .expect("status");
        assert_eq!(clean.exit_code, 0);
        assert_eq!(clean.outputs.get("clean").map(String::as_str), Some("true"));

        fs::write(temp.path().join("new.txt"), "x").expect("write");
        let dirty = registry
            .execute(&step("st", GIT_STATUS_STEP, json!({})), &ctx)
            .expect("status");
        assert_eq!(dirty.outputs.get("clean").map(String::as_str), Some("false"));
        assert_eq!(dirty.outputs.get("count").map(String::as_str), Some("1"));
        assert_eq!(
            dirty.outputs.get("result").map(String::as_str),
            Some("?? new.txt")
        );
    }

    #[test]
    fn git_diff_publishes_diff_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_git_repo(temp.path());
        fs::write(temp.path().join("README.md"), "changed\n").expect("write");
        let ctx = StepContext::new(temp.path());

        let result = registry()
            .execute(&step("d", GIT_DIFF_STEP, json!({"stat": true})), &ctx)
            .expect("diff");
        assert_eq!(result.exit_code, 0);
        assert!(
            result.outputs["result"].contains("README.md"),
            "diff stat should name the changed file"
        );
    }

    #[test]
    fn malformed_status_output_publishes_no_counts() {
        let mut outputs = BTreeMap::new();
        publish_status("?? ok.txt\nM\n", &mut outputs);
        assert!(outputs.is_empty());

        publish_status("?? ok.txt\n", &mut outputs);
        assert_eq!(outputs.get("count").map(String::as_str), Some("1"));
        assert_eq!(outputs.get("clean").map(String::as_str), Some("false"));
    }
}
