//! Canonical paths and scaffolding for `.provisioner/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::config::{ProvisionerConfig, write_config};
use super::run_state::RunState;

/// All canonical paths within `.provisioner/` for a project root.
#[derive(Debug, Clone)]
pub struct ProvisionerPaths {
    pub root: PathBuf,
    pub provisioner_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    /// Scratch clone of the soft-serve admin `config` repository.
    pub softserve_config_dir: PathBuf,
}

impl ProvisionerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let provisioner_dir = root.join(".provisioner");
        let state_dir = provisioner_dir.join("state");
        Self {
            root: root.clone(),
            provisioner_dir: provisioner_dir.clone(),
            state_dir: state_dir.clone(),
            config_path: provisioner_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            softserve_config_dir: provisioner_dir.join("softserve-config"),
        }
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_provisioner`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Write default config and an empty run state if missing.
///
/// An existing run state is never overwritten, even with `force`; clearing
/// flags goes through `reset` or `destroy`.
pub fn init_provisioner(root: &Path, options: &InitOptions) -> Result<ProvisionerPaths> {
    let paths = ProvisionerPaths::new(root);
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &ProvisionerConfig::default())
            .context("write default config")?;
        info!(path = %paths.config_path.display(), "wrote config");
    }
    if !paths.run_state_path.exists() {
        RunState::empty(&paths.run_state_path)
            .flush()
            .context("write empty run state")?;
        info!(path = %paths.run_state_path.display(), "wrote run state");
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;

    #[test]
    fn init_writes_scaffold() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_provisioner(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.config_path.exists());
        assert_eq!(
            fs::read_to_string(&paths.run_state_path).expect("read"),
            "{}\n"
        );
    }

    #[test]
    fn init_force_keeps_run_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_provisioner(temp.path(), &InitOptions { force: false }).expect("init");
        let mut state = RunState::load(&paths.run_state_path).expect("load");
        state
            .commit("create.terraformapplied.base", Value::Bool(true))
            .expect("commit");

        init_provisioner(temp.path(), &InitOptions { force: true }).expect("init again");
        let state = RunState::load(&paths.run_state_path).expect("reload");
        assert!(state.get_bool("create.terraformapplied.base"));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let paths = ProvisionerPaths::new("/work");
        assert_eq!(
            paths.resolve(Path::new("/etc/kubeconfig")),
            PathBuf::from("/etc/kubeconfig")
        );
        assert_eq!(
            paths.resolve(Path::new("gitops")),
            PathBuf::from("/work/gitops")
        );
    }
}
