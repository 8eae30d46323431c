use anyhow::{Context, Result};
use postes_core::Config;
use std::path::PathBuf;

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("Cannot determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the shared client config, writing defaults on first start.
pub fn load_daemon_config(path: Option<&str>) -> Result<(Config, PathBuf)> {
    let path = match path {
        Some(p) => expand_home(p)?,
        None => Config::default_path()?,
    };
    let existed = path.exists();
    let config = Config::load_or_create(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if !existed {
        tracing::info!(path = %path.display(), "created default config");
    }
    Ok((config, path))
}
