//! Engine configuration stored at `<macbox home>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Engine configuration (TOML).
///
/// Hand-edited by operators. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MacboxConfig {
    /// Worker count used by swarm commands when `--max-parallel` is not given.
    pub max_parallel_default: usize,

    /// Per-step deadline for process steps in seconds. `0` disables the deadline.
    pub step_timeout_secs: u64,

    /// Keep at most this many bytes of stdout and of stderr per step.
    pub output_limit_bytes: usize,

    /// Write a result file under `.macbox/flows/` after every run.
    pub persist_results: bool,

    /// Program and leading arguments used to run `shell` steps; the command is appended.
    pub shell: Vec<String>,
}

impl Default for MacboxConfig {
    fn default() -> Self {
        Self {
            max_parallel_default: 4,
            step_timeout_secs: 0,
            output_limit_bytes: 16 * 1024 * 1024,
            persist_results: true,
            shell: vec!["sh".to_string(), "-c".to_string()],
        }
    }
}

impl MacboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_default == 0 {
            return Err(anyhow!("max_parallel_default must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.shell.is_empty() || self.shell[0].trim().is_empty() {
            return Err(anyhow!("shell must be a non-empty array"));
        }
        Ok(())
    }

    /// Default step deadline, if any.
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0).then(|| Duration::from_secs(self.step_timeout_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MacboxConfig::default()`.
pub fn load_config(path: &Path) -> Result<MacboxConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = MacboxConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MacboxConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Render config as TOML with a trailing newline.
pub fn render_config(cfg: &MacboxConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}
