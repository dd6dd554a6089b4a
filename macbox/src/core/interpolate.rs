//! `${steps.<id>.<path>}` substitution over step arguments.
//!
//! Resolution never fails: a reference to a step that has not run (unknown,
//! future, or the current step) or to a missing output degrades to the empty
//! string. Step ids end at the first `.`, so ids containing one can never be
//! referenced; the project loader rejects them.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::core::types::StepResult;

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{steps\.([^.}]+)\.([^}]+)\}").unwrap());

/// Resolve every reference in `args` against results of already-executed steps.
pub fn resolve_args(args: &Map<String, Value>, prior: &[StepResult]) -> Map<String, Value> {
    args.iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, prior)))
        .collect()
}

/// Walk `value` recursively, rebuilding objects and arrays. Non-string scalars pass through.
pub fn resolve_value(value: &Value, prior: &[StepResult]) -> Value {
    match value {
        Value::String(text) => match resolve_str(text, prior) {
            Cow::Borrowed(_) => value.clone(),
            Cow::Owned(resolved) => Value::String(resolved),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, prior)).collect()),
        Value::Object(map) => Value::Object(resolve_args(map, prior)),
        _ => value.clone(),
    }
}

/// Substitute references inside one string. Strings without references come back borrowed.
pub fn resolve_str<'a>(text: &'a str, prior: &[StepResult]) -> Cow<'a, str> {
    REFERENCE_RE.replace_all(text, |caps: &Captures<'_>| lookup(prior, &caps[1], &caps[2]))
}

fn lookup(prior: &[StepResult], step_id: &str, path: &str) -> String {
    let Some(result) = prior.iter().find(|r| r.step_id == step_id) else {
        return String::new();
    };
    match path {
        "exitCode" => result.exit_code.to_string(),
        "stdout" => result.stdout.clone().unwrap_or_default(),
        "stderr" => result.stderr.clone().unwrap_or_default(),
        _ => path
            .strip_prefix("outputs.")
            .and_then(|key| result.outputs.get(key))
            .cloned()
            .unwrap_or_default(),
    }
}
