//! Workspace provisioning: new git worktrees registered as workspaces.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::types::{StepDefinition, WorkspaceFlowResult};
use crate::flow::FlowEngine;
use crate::io::executor::StepContext;
use crate::io::git::Git;
use crate::io::paths::{MacboxPaths, validate_record_id};
use crate::io::project::WORKSPACE_CREATE_HOOK;
use crate::io::registry::{Registry, SessionRecord, WorkspaceRecord};

/// Create `count` workspaces named `<prefix>-1..=count` from `session`.
///
/// Each gets a worktree on branch `macbox/<id>` under the macbox home. Nothing
/// is created when any of the ids is already registered.
#[instrument(skip_all, fields(session = %session.id, count = count, prefix = prefix))]
pub fn create_workspaces(
    registry: &dyn Registry,
    paths: &MacboxPaths,
    session: &SessionRecord,
    count: usize,
    prefix: &str,
) -> Result<Vec<WorkspaceRecord>> {
    if count == 0 {
        bail!("workspace count must be at least 1");
    }
    validate_record_id(prefix).context("invalid workspace prefix")?;
    let ids: Vec<String> = (1..=count).map(|n| format!("{prefix}-{n}")).collect();
    for id in &ids {
        if registry.workspace_exists(id)? {
            bail!("workspace '{id}' already exists");
        }
    }

    let git = Git::new(&session.repo_root);
    ids.into_iter()
        .map(|id| {
            let worktree_path = paths.worktree_path(&session.id, &id)?;
            git.worktree_add(&worktree_path, &format!("macbox/{id}"))
                .with_context(|| format!("create worktree for workspace '{id}'"))?;
            let record = WorkspaceRecord {
                id,
                session_id: session.id.clone(),
                worktree_path,
                created_at: Some(Utc::now()),
            };
            registry.save_workspace(&record)?;
            info!(workspace = %record.id, path = %record.worktree_path.display(), "workspace created");
            Ok(record)
        })
        .collect()
}

/// Run the project's workspace-create hook in each workspace.
///
/// Failures are logged and skipped; the workspaces stay registered. Returns
/// the hook runs that completed.
pub fn run_workspace_create_hooks(
    engine: &FlowEngine<'_>,
    hooks: &[StepDefinition],
    session: &SessionRecord,
    workspaces: &[WorkspaceRecord],
) -> Vec<WorkspaceFlowResult> {
    if hooks.is_empty() {
        return Vec::new();
    }
    let mut results = Vec::with_capacity(workspaces.len());
    for workspace in workspaces {
        let ctx = StepContext::for_workspace(workspace, session);
        match engine.run_steps(WORKSPACE_CREATE_HOOK, hooks, &ctx) {
            Ok(flow_result) => {
                if !flow_result.ok {
                    warn!(workspace = %workspace.id, "workspace create hook failed");
                }
                results.push(WorkspaceFlowResult {
                    workspace_id: workspace.id.clone(),
                    flow_result,
                });
            }
            Err(err) => {
                warn!(workspace = %workspace.id, err = %format!("{err:#}"), "workspace create hook errored");
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::MacboxConfig;
    use crate::io::executor::StepRegistry;
    use crate::test_support::{MemoryRegistry, init_git_repo, shell_step};

    fn session(repo: &std::path::Path) -> SessionRecord {
        SessionRecord {
            id: "s1".to_string(),
            repo_root: repo.to_path_buf(),
            git_common_dir: None,
            git_dir: None,
            agent_kind: Some("codex".to_string()),
            profiles: vec![],
        }
    }

    #[test]
    fn creates_numbered_worktrees_and_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_git_repo(&repo);
        let paths = MacboxPaths::new(temp.path().join("home"));
        let registry = MemoryRegistry::default();

        let created =
            create_workspaces(&registry, &paths, &session(&repo), 2, "ws").expect("create");

        let ids: Vec<&str> = created.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["ws-1", "ws-2"]);
        for workspace in &created {
            assert!(workspace.worktree_path.join("README.md").is_file());
            assert_eq!(
                registry.load_workspace(&workspace.id).expect("load"),
                *workspace
            );
        }
        assert_eq!(
            created[1].worktree_path,
            paths.worktree_path("s1", "ws-2").expect("path")
        );
    }

    #[test]
    fn existing_id_blocks_the_whole_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_git_repo(&repo);
        let paths = MacboxPaths::new(temp.path().join("home"));
        let registry = MemoryRegistry::default();
        registry.insert_workspace(WorkspaceRecord {
            id: "ws-2".to_string(),
            session_id: "s1".to_string(),
            worktree_path: temp.path().join("elsewhere"),
            created_at: None,
        });

        let err = create_workspaces(&registry, &paths, &session(&repo), 3, "ws").unwrap_err();

        assert!(err.to_string().contains("workspace 'ws-2' already exists"));
        assert!(!registry.workspace_exists("ws-1").expect("exists"));
        assert!(!paths.worktree_path("s1", "ws-1").expect("path").exists());
    }

    #[test]
    fn rejects_zero_count_and_path_like_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = MacboxPaths::new(temp.path());
        let registry = MemoryRegistry::default();
        let session = session(temp.path());

        assert!(create_workspaces(&registry, &paths, &session, 0, "ws").is_err());
        assert!(create_workspaces(&registry, &paths, &session, 1, "a/b").is_err());
        assert!(create_workspaces(&registry, &paths, &session, 1, "").is_err());
    }

    #[test]
    fn hooks_run_in_each_workspace_and_failures_do_not_abort() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        init_git_repo(&repo);
        let paths = MacboxPaths::new(temp.path().join("home"));
        let registry = MemoryRegistry::default();
        let session = session(&repo);
        let created = create_workspaces(&registry, &paths, &session, 2, "ws").expect("create");

        let steps = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&steps).persist_results(false);
        let hooks = vec![
            shell_step("mark", "echo \"$MACBOX_WORKSPACE_ID\" > hook.txt"),
            shell_step("fail-second", "test \"$MACBOX_WORKSPACE_ID\" != ws-2"),
        ];

        let results = run_workspace_create_hooks(&engine, &hooks, &session, &created);

        assert_eq!(results.len(), 2);
        assert!(results[0].flow_result.ok);
        assert_eq!(results[1].workspace_id, "ws-2");
        assert!(!results[1].flow_result.ok);
        assert_eq!(results[1].flow_result.flow_name, WORKSPACE_CREATE_HOOK);
        for workspace in &created {
            let marker =
                std::fs::read_to_string(workspace.worktree_path.join("hook.txt")).expect("marker");
            assert_eq!(marker.trim(), workspace.id);
        }
    }

    #[test]
    fn no_hooks_means_no_runs() {
        let steps = StepRegistry::builtin(&MacboxConfig::default());
        let engine = FlowEngine::new(&steps);
        let session = session(std::path::Path::new("/nonexistent"));
        let workspace = WorkspaceRecord {
            id: "ws-1".to_string(),
            session_id: "s1".to_string(),
            worktree_path: "/nonexistent/ws-1".into(),
            created_at: None,
        };
        assert!(run_workspace_create_hooks(&engine, &[], &session, &[workspace]).is_empty());
    }
}
