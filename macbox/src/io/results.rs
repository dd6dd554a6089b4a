//! Flow result files under `<workdir>/.macbox/flows/`.
//!
//! Each run lands in `<flow>-<YYYYMMDDTHHMMSSmmmZ>.json`. Files are written to
//! a hidden temp file first and linked into place without clobbering, so a
//! concurrent reader sees either nothing or the complete file, and two runs
//! finishing in the same millisecond get distinct names.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::core::types::{FlowResult, FlowResultRecord};
use crate::io::paths::flow_results_dir;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// A result file read back from disk.
#[derive(Debug, Clone)]
pub struct StoredFlowResult {
    pub path: PathBuf,
    pub record: FlowResultRecord,
}

/// Persist `result` into the results directory of `workdir`. Returns the final path.
#[instrument(skip_all, fields(flow = %result.flow_name, workdir = %workdir.display()))]
pub fn persist_flow_result(result: &FlowResult, workdir: &Path) -> Result<PathBuf> {
    let dir = flow_results_dir(workdir);
    fs::create_dir_all(&dir).with_context(|| format!("create results dir {}", dir.display()))?;

    let mut payload = serde_json::to_string_pretty(&FlowResultRecord::new(result.clone()))
        .context("serialize flow result")?;
    payload.push('\n');

    let mut tmp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(payload.as_bytes())
        .context("write temp flow result")?;
    tmp.as_file().sync_all().context("sync temp flow result")?;

    let stem = format!(
        "{}-{}",
        file_safe_name(&result.flow_name),
        compact_timestamp(result.completed_at)
    );
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{stem}.json")
        } else {
            format!("{stem}-{attempt}.json")
        };
        let path = dir.join(name);
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "flow result persisted");
                return Ok(path);
            }
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => tmp = err.file,
            Err(err) => {
                return Err(err.error).with_context(|| format!("persist {}", path.display()));
            }
        }
    }
    Err(anyhow!(
        "no free result file name for {stem} after {MAX_NAME_ATTEMPTS} attempts"
    ))
}

/// Read every result file for `workdir`, oldest name first.
///
/// Hidden entries (in-flight temp files) are ignored.
pub fn list_flow_results(workdir: &Path) -> Result<Vec<StoredFlowResult>> {
    let dir = flow_results_dir(workdir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let record: FlowResultRecord = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            Ok(StoredFlowResult { path, record })
        })
        .collect()
}

/// `20260105T093000123Z` style token used in result file names.
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Replace characters that are unsafe in file names with `_`.
pub fn file_safe_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() || safe.starts_with('.') {
        format!("_{safe}")
    } else {
        safe
    }
}
