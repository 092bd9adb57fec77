use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};
use warpconfig::PipelineConfig;

use crate::paths::AppPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Installed,
    Replaced,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub force: bool,
}

pub fn default_config_toml() -> Result<String> {
    PipelineConfig::default()
        .to_toml_string()
        .context("failed to serialize the built-in configuration")
}

/// Installs the built-in config as the user config. Leaves an existing file
/// alone unless `force` is set.
pub fn write_default_config(paths: &AppPaths, options: WriteOptions) -> Result<(PathBuf, WriteOutcome)> {
    let target = paths.config_file();
    let existed = target.exists();
    if existed && !options.force {
        debug!(path = %target.display(), "user config already present; not overwriting");
        return Ok((target, WriteOutcome::AlreadyPresent));
    }

    fs::create_dir_all(paths.config_dir()).with_context(|| {
        format!(
            "failed to prepare config directory at {}",
            paths.config_dir().display()
        )
    })?;
    fs::write(&target, default_config_toml()?)
        .with_context(|| format!("failed to write default config to {}", target.display()))?;
    info!(path = %target.display(), "installed default configuration");

    let outcome = if existed {
        WriteOutcome::Replaced
    } else {
        WriteOutcome::Installed
    };
    Ok((target, outcome))
}

/// `--config`, then the user config, then the built-in defaults.
pub fn resolve_config(paths: &AppPaths, explicit: Option<&Path>) -> Result<(PipelineConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }
    let user = paths.config_file();
    if user.exists() {
        let config = PipelineConfig::load(&user)
            .with_context(|| format!("failed to load user config {}", user.display()))?;
        return Ok((config, Some(user)));
    }
    debug!("no user config; using built-in defaults");
    Ok((PipelineConfig::default(), None))
}
