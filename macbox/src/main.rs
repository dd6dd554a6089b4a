//! `macbox` command line: run flows in workspaces and fan them out as swarms.
//!
//! Flows are declared in `macbox.json` at the repository root. Workspace and
//! session records live under the macbox home (`$MACBOX_HOME`, else
//! `~/.macbox`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use macbox::core::types::{FlowResult, FlowResultRecord, SwarmResult, WorkspaceFlowResult};
use macbox::events::TracingObserver;
use macbox::exit_codes;
use macbox::flow::FlowEngine;
use macbox::io::config::{MacboxConfig, load_config, render_config};
use macbox::io::executor::{StepContext, StepRegistry};
use macbox::io::git::Git;
use macbox::io::paths::MacboxPaths;
use macbox::io::project::load_project;
use macbox::io::registry::{FileRegistry, Registry, WorkspaceRecord};
use macbox::io::results::list_flow_results;
use macbox::logging;
use macbox::provision::{create_workspaces, run_workspace_create_hooks};
use macbox::swarm::{SwarmOrchestrator, SwarmOverrides};

#[derive(Parser)]
#[command(
    name = "macbox",
    version,
    about = "Run declarative flows in sandboxed git worktrees"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run or inspect flows in a single workspace.
    #[command(subcommand)]
    Flow(FlowCommand),
    /// Run a flow across many workspaces.
    #[command(subcommand)]
    Swarm(SwarmCommand),
    /// Inspect engine configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum FlowCommand {
    /// Run a declared flow in a workspace, or in the current directory.
    Run(FlowRunArgs),
    /// List persisted flow results.
    Results {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SwarmCommand {
    /// Run a flow in each listed workspace.
    Run {
        flow: String,
        /// Comma-separated workspace ids.
        #[arg(long, value_delimiter = ',', required = true)]
        workspaces: Vec<String>,
        #[command(flatten)]
        limits: ParallelArgs,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        repo: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Create workspaces from a session, optionally running a flow in them.
    Create(CreateArgs),
}

#[derive(Args)]
struct FlowRunArgs {
    flow: String,
    /// Registered workspace to run in.
    #[arg(long)]
    workspace: Option<String>,
    /// Repository whose `macbox.json` declares the flow.
    #[arg(long)]
    repo: Option<PathBuf>,
    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    session: String,
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    count: u64,
    #[arg(long, default_value = "ws")]
    prefix: String,
    /// Flow to run across the new workspaces once created.
    #[arg(long)]
    flow: Option<String>,
    #[command(flatten)]
    limits: ParallelArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
}

#[derive(Args)]
struct ParallelArgs {
    /// Concurrent workspaces (default from config).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_parallel: Option<u64>,
}

#[derive(Args)]
struct OverrideArgs {
    /// Extra environment variable for every step, as KEY=VALUE.
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
    #[arg(long = "profile")]
    profiles: Vec<String>,
    #[arg(long = "capability")]
    capabilities: Vec<String>,
    /// Agent kind replacing the session's.
    #[arg(long)]
    agent: Option<String>,
}

impl OverrideArgs {
    fn into_overrides(self) -> SwarmOverrides {
        SwarmOverrides {
            env: self.env.into_iter().collect(),
            profiles: self.profiles,
            capabilities: self.capabilities,
            agent: self.agent,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

/// Everything `run` needs that comes from the environment.
struct Env {
    paths: MacboxPaths,
    config: MacboxConfig,
    cwd: PathBuf,
}

impl Env {
    fn load() -> Result<Self> {
        let paths = MacboxPaths::from_env()?;
        let config = load_config(&paths.config_path)?;
        let cwd = std::env::current_dir().context("resolve current directory")?;
        Ok(Self { paths, config, cwd })
    }

    fn max_parallel(&self, args: &ParallelArgs) -> usize {
        args.max_parallel
            .map_or(self.config.max_parallel_default, |n| n as usize)
    }
}

fn run(cli: Cli) -> Result<i32> {
    let env = Env::load()?;
    let registry = FileRegistry::new(env.paths.clone());
    let steps = StepRegistry::builtin(&env.config);
    let observer = TracingObserver;
    let engine = FlowEngine::new(&steps)
        .with_observer(&observer)
        .persist_results(env.config.persist_results);

    match cli.command {
        Command::Flow(FlowCommand::Run(args)) => cmd_flow_run(&env, &registry, &engine, args),
        Command::Flow(FlowCommand::Results { workspace, json }) => {
            cmd_flow_results(&env, &registry, workspace, json)
        }
        Command::Swarm(SwarmCommand::Run {
            flow,
            workspaces,
            limits,
            overrides,
            repo,
            json,
        }) => {
            let workspace_ids: Vec<String> = workspaces
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
            if workspace_ids.is_empty() {
                eprintln!("error: --workspaces needs at least one workspace id");
                return Ok(exit_codes::USAGE);
            }
            let repo_root = resolve_repo_root(repo, &env.cwd);
            let project = load_project(&repo_root)?;
            let definition = project.flow(&flow)?;
            let result = SwarmOrchestrator::new(&engine, &registry).run_swarm(
                &flow,
                definition,
                &workspace_ids,
                env.max_parallel(&limits),
                &overrides.into_overrides(),
            )?;
            print_swarm(&result, json)?;
            Ok(swarm_exit_code(&result))
        }
        Command::Swarm(SwarmCommand::Create(args)) => {
            cmd_swarm_create(&env, &registry, &engine, args)
        }
        Command::Config(ConfigCommand::Show) => {
            print!("{}", render_config(&env.config)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_flow_run(
    env: &Env,
    registry: &FileRegistry,
    engine: &FlowEngine<'_>,
    args: FlowRunArgs,
) -> Result<i32> {
    let FlowRunArgs {
        flow,
        workspace,
        repo,
        json,
    } = args;
    let ctx = match &workspace {
        Some(id) => {
            let record = registry.load_workspace(id)?;
            let session = registry.load_session(&record.session_id)?;
            StepContext::for_workspace(&record, &session)
        }
        None => {
            let mut ctx = StepContext::new(&env.cwd);
            ctx.repo_root = resolve_repo_root(None, &env.cwd);
            ctx
        }
    };
    let repo_root = repo.unwrap_or_else(|| ctx.repo_root.clone());
    let project = load_project(&repo_root)?;
    let definition = project.flow(&flow)?;

    let result = engine.run_flow(&flow, definition, workspace.as_deref(), &ctx)?;
    if json {
        print_json(&FlowResultRecord::new(result.clone()))?;
    } else {
        print_flow(&result);
    }
    Ok(if result.ok {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_flow_results(
    env: &Env,
    registry: &FileRegistry,
    workspace: Option<String>,
    json: bool,
) -> Result<i32> {
    let workdir = match &workspace {
        Some(id) => registry.load_workspace(id)?.worktree_path,
        None => env.cwd.clone(),
    };
    let stored = list_flow_results(&workdir)?;
    if json {
        let records: Vec<&FlowResultRecord> = stored.iter().map(|s| &s.record).collect();
        print_json(&records)?;
    } else {
        for entry in &stored {
            let name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            println!(
                "{name} ok={} flow={}",
                entry.record.result.ok, entry.record.result.flow_name
            );
        }
    }
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateReport<'a> {
    workspaces: &'a [WorkspaceRecord],
    hooks: &'a [WorkspaceFlowResult],
    #[serde(skip_serializing_if = "Option::is_none")]
    swarm: Option<&'a SwarmResult>,
}

fn cmd_swarm_create(
    env: &Env,
    registry: &FileRegistry,
    engine: &FlowEngine<'_>,
    args: CreateArgs,
) -> Result<i32> {
    let max_parallel = env.max_parallel(&args.limits);
    let session = registry.load_session(&args.session)?;
    let project = load_project(&session.repo_root)?;
    // Resolve the flow before touching git so a typo creates nothing.
    let flow = args.flow.as_deref();
    let definition = flow.map(|name| project.flow(name)).transpose()?;

    let created = create_workspaces(
        registry,
        &env.paths,
        &session,
        args.count as usize,
        &args.prefix,
    )?;
    let hooks =
        run_workspace_create_hooks(engine, &project.hooks.workspace_create, &session, &created);

    let swarm = match (flow, definition) {
        (Some(name), Some(definition)) => {
            let ids: Vec<String> = created.iter().map(|w| w.id.clone()).collect();
            Some(SwarmOrchestrator::new(engine, registry).run_swarm(
                name,
                definition,
                &ids,
                max_parallel,
                &SwarmOverrides::default(),
            )?)
        }
        _ => None,
    };

    if args.json {
        print_json(&CreateReport {
            workspaces: &created,
            hooks: &hooks,
            swarm: swarm.as_ref(),
        })?;
    } else {
        for workspace in &created {
            println!(
                "created {} {}",
                workspace.id,
                workspace.worktree_path.display()
            );
        }
        for hook in hooks.iter().filter(|h| !h.flow_result.ok) {
            println!("hook failed in {}", hook.workspace_id);
        }
        if let Some(result) = &swarm {
            print_swarm(result, false)?;
        }
    }
    Ok(swarm.as_ref().map_or(exit_codes::OK, swarm_exit_code))
}

/// `--repo`, else the enclosing git toplevel, else `cwd` itself.
fn resolve_repo_root(explicit: Option<PathBuf>, cwd: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| {
        Git::new(cwd)
            .toplevel()
            .unwrap_or_else(|_| cwd.to_path_buf())
    })
}

fn swarm_exit_code(result: &SwarmResult) -> i32 {
    if result.all_succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}

fn print_flow(result: &FlowResult) {
    println!("ok={}", result.ok);
    for step in &result.steps {
        match &step.error {
            Some(error) => println!("step {} exit={} error={error}", step.step_id, step.exit_code),
            None => println!("step {} exit={}", step.step_id, step.exit_code),
        }
    }
}

fn print_swarm(result: &SwarmResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    for entry in &result.results {
        let status = if entry.flow_result.ok { "ok" } else { "fail" };
        println!("{} {status}", entry.workspace_id);
    }
    println!(
        "summary: total={} succeeded={} failed={}",
        result.summary.total, result.summary.succeeded, result.summary.failed
    );
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flow_run_with_workspace() {
        let cli = Cli::parse_from(["macbox", "flow", "run", "ci", "--workspace", "w1", "--json"]);
        match cli.command {
            Command::Flow(FlowCommand::Run(args)) => {
                assert_eq!(args.flow, "ci");
                assert_eq!(args.workspace.as_deref(), Some("w1"));
                assert!(args.json);
            }
            _ => panic!("expected flow run"),
        }
    }

    #[test]
    fn parse_swarm_run_splits_workspaces_and_overrides() {
        let cli = Cli::parse_from([
            "macbox",
            "swarm",
            "run",
            "ci",
            "--workspaces",
            "w1,w2,w3",
            "--max-parallel",
            "2",
            "--env",
            "MODE=fast",
            "--profile",
            "net",
            "--agent",
            "codex",
        ]);
        let Command::Swarm(SwarmCommand::Run {
            workspaces,
            limits,
            overrides,
            ..
        }) = cli.command
        else {
            panic!("expected swarm run");
        };
        assert_eq!(workspaces, vec!["w1", "w2", "w3"]);
        assert_eq!(limits.max_parallel, Some(2));
        let overrides = overrides.into_overrides();
        assert_eq!(overrides.env["MODE"], "fast");
        assert_eq!(overrides.profiles, vec!["net"]);
        assert_eq!(overrides.agent.as_deref(), Some("codex"));
    }

    #[test]
    fn zero_parallelism_is_a_usage_error() {
        let err = Cli::try_parse_from([
            "macbox",
            "swarm",
            "run",
            "ci",
            "--workspaces",
            "w1",
            "--max-parallel",
            "0",
        ])
        .err()
        .expect("parse error");
        assert_eq!(err.exit_code(), exit_codes::USAGE);
    }

    #[test]
    fn missing_flow_name_is_a_usage_error() {
        let err = Cli::try_parse_from(["macbox", "flow", "run"])
            .err()
            .expect("parse error");
        assert_eq!(err.exit_code(), exit_codes::USAGE);
    }

    #[test]
    fn env_pairs_require_a_key() {
        assert_eq!(
            parse_env_pair("A=b=c"),
            Ok(("A".to_string(), "b=c".to_string()))
        );
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn explicit_repo_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let explicit = temp.path().join("other");
        assert_eq!(
            resolve_repo_root(Some(explicit.clone()), temp.path()),
            explicit
        );
    }
}
