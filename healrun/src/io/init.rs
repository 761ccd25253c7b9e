//! Layout of the `.healrun/` directory and its scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{EngineConfig, write_config};

/// All canonical paths within `.healrun/` for a workspace root.
#[derive(Debug, Clone)]
pub struct HealrunPaths {
    pub root: PathBuf,
    pub healrun_dir: PathBuf,
    pub state_dir: PathBuf,
    pub conversations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
}

impl HealrunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let healrun_dir = root.join(".healrun");
        Self {
            root: root.clone(),
            state_dir: healrun_dir.join("state"),
            conversations_dir: healrun_dir.join("conversations"),
            gitignore_path: healrun_dir.join(".gitignore"),
            config_path: healrun_dir.join("config.toml"),
            healrun_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    pub force: bool,
}

/// Create `.healrun/` in `root` with a default config.
///
/// Fails if `.healrun/` already exists unless `force` is set; forcing resets
/// the config and keeps conversations and state.
pub fn init_layout(root: &Path, options: &InitOptions) -> Result<HealrunPaths> {
    let paths = HealrunPaths::new(root);
    if paths.healrun_dir.exists() && !paths.healrun_dir.is_dir() {
        return Err(anyhow!("init: .healrun exists but is not a directory"));
    }
    if paths.healrun_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .healrun already exists (use --force to overwrite)"
        ));
    }

    for dir in [&paths.healrun_dir, &paths.state_dir, &paths.conversations_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, HEALRUN_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    Ok(paths)
}

const HEALRUN_GITIGNORE: &str = "state/\nconversations/\n";
