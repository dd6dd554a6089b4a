//! Project config (`macbox.json`): declared flows and lifecycle hooks.
//!
//! The file is validated against an embedded JSON Schema before it is
//! deserialized, then step ids are normalized: empty ids become `step-<index>`
//! and duplicates within one step list are rejected. Ids may not contain `.`
//! or `}`, which would make them unreachable from `${steps.<id>...}`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{FlowDefinition, StepDefinition};
use crate::error::LookupError;
use crate::io::paths::project_config_path;

const PROJECT_SCHEMA: &str = include_str!("../../schemas/project.v1.schema.json");

/// Label under which workspace-create hooks run and persist.
pub const WORKSPACE_CREATE_HOOK: &str = "hook-workspaceCreate";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub flows: BTreeMap<String, FlowDefinition>,
    #[serde(default)]
    pub hooks: Hooks,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    /// Steps run inside every newly created workspace.
    #[serde(default)]
    pub workspace_create: Vec<StepDefinition>,
}

impl ProjectConfig {
    /// Fails with [`LookupError::FlowNotFound`] when `name` is not declared.
    pub fn flow(&self, name: &str) -> Result<&FlowDefinition> {
        self.flows
            .get(name)
            .ok_or_else(|| LookupError::FlowNotFound(name.to_string()).into())
    }
}

/// Load `macbox.json` from `repo_root`. A missing file is an empty project.
#[instrument(skip_all, fields(repo_root = %repo_root.display()))]
pub fn load_project(repo_root: &Path) -> Result<ProjectConfig> {
    let path = project_config_path(repo_root);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no project config");
            return Ok(ProjectConfig::default());
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    parse_project(&contents).with_context(|| format!("load project config {}", path.display()))
}

/// Parse and normalize project config text.
pub fn parse_project(contents: &str) -> Result<ProjectConfig> {
    let value: Value = serde_json::from_str(contents).context("parse project json")?;
    validate_schema(&value)?;
    let mut project: ProjectConfig =
        serde_json::from_value(value).context("deserialize project config")?;
    for (name, flow) in &mut project.flows {
        normalize_step_ids(&mut flow.steps).with_context(|| format!("flow '{name}'"))?;
    }
    normalize_step_ids(&mut project.hooks.workspace_create)
        .context("hooks.workspaceCreate")?;
    Ok(project)
}

/// Fill empty ids with `step-<index>`; reject duplicates and unreferenceable ids.
pub fn normalize_step_ids(steps: &mut [StepDefinition]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for (index, step) in steps.iter_mut().enumerate() {
        if step.id.is_empty() {
            step.id = format!("step-{index}");
        }
        if step.id.contains(['.', '}']) {
            bail!("step id '{}' must not contain '.' or '}}'", step.id);
        }
        if !seen.insert(step.id.clone()) {
            bail!("duplicate step id '{}'", step.id);
        }
    }
    Ok(())
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PROJECT_SCHEMA).context("parse project schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile project schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
