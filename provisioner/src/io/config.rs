//! Provisioner configuration stored under `.provisioner/config.toml`.
//!
//! Loaded once at startup and passed by reference into every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Provisioner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub aws: AwsConfig,
    pub tools: ToolsConfig,
    pub paths: PathsConfig,
    pub softserve: SoftServeConfig,
    pub gitlab: GitlabConfig,
}

/// Account parameters handed to terraform as `TF_VAR_*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AwsConfig {
    pub account_id: String,
    pub region: String,
    /// Hosted zone; GitLab lives at `gitlab.<domain_name>`.
    pub domain_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub terraform: String,
    pub kubectl: String,
    pub git: String,
    pub kubeconfig: PathBuf,
    /// Per-command wall-clock limit in seconds.
    pub command_timeout_secs: u64,
    /// Captured stdout/stderr beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            terraform: "terraform".to_string(),
            kubectl: "kubectl".to_string(),
            git: "git".to_string(),
            kubeconfig: PathBuf::from("kubeconfig"),
            command_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ToolsConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Rendered gitops repository (contains `terraform/base`, `terraform/gitlab`).
    pub gitops_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            gitops_dir: PathBuf::from("gitops"),
        }
    }
}

impl PathsConfig {
    pub fn terraform_dir(&self, module: &str) -> PathBuf {
        self.gitops_dir.join("terraform").join(module)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SoftServeConfig {
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub repo_name: String,
    pub admin_name: String,
    /// Optional private key used by git over ssh.
    pub ssh_private_key_path: Option<PathBuf>,
    pub readiness_timeout_secs: u64,
    pub poll_interval_millis: u64,
}

impl Default for SoftServeConfig {
    fn default() -> Self {
        Self {
            namespace: "soft-serve".to_string(),
            service: "svc/soft-serve".to_string(),
            local_port: 8022,
            remote_port: 22,
            repo_name: "gitops".to_string(),
            admin_name: "kubefirst".to_string(),
            ssh_private_key_path: None,
            readiness_timeout_secs: 60,
            poll_interval_millis: 500,
        }
    }
}

impl SoftServeConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn repo_url(&self, repo: &str) -> String {
        format!("ssh://127.0.0.1:{}/{}", self.local_port, repo)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitlabConfig {
    pub namespace: String,
    /// Label selector of the toolbox pod used for `gitlab-rails runner`.
    pub toolbox_selector: String,
    pub runner_secret: String,
    pub token_length: usize,
    pub key_title: String,
    pub public_key_path: PathBuf,
    /// Overrides `https://gitlab.<domain_name>`.
    pub base_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            namespace: "gitlab".to_string(),
            toolbox_selector: "app=toolbox".to_string(),
            runner_secret: "gitlab-gitlab-runner-secret".to_string(),
            token_length: 20,
            key_title: "kubefirst".to_string(),
            public_key_path: PathBuf::from("id_rsa.pub"),
            base_url: None,
            http_timeout_secs: 30,
        }
    }
}

impl GitlabConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl ProvisionerConfig {
    /// GitLab base URL without a trailing slash.
    pub fn gitlab_base_url(&self) -> String {
        match &self.gitlab.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://gitlab.{}", self.aws.domain_name),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid =
            |msg: &str| -> Result<()> { Err(ProvisionError::Config(msg.to_string()).into()) };
        if self.tools.command_timeout_secs == 0 {
            return invalid("tools.command_timeout_secs must be > 0");
        }
        if self.tools.output_limit_bytes == 0 {
            return invalid("tools.output_limit_bytes must be > 0");
        }
        for (name, binary) in [
            ("tools.terraform", &self.tools.terraform),
            ("tools.kubectl", &self.tools.kubectl),
            ("tools.git", &self.tools.git),
        ] {
            if binary.trim().is_empty() {
                return invalid(&format!("{name} must not be empty"));
            }
        }
        if self.softserve.readiness_timeout_secs == 0 {
            return invalid("softserve.readiness_timeout_secs must be > 0");
        }
        if self.softserve.poll_interval_millis == 0 {
            return invalid("softserve.poll_interval_millis must be > 0");
        }
        // A hyphenated uuid is 36 chars.
        if self.gitlab.token_length == 0 || self.gitlab.token_length > 36 {
            return invalid("gitlab.token_length must be within 1..=36");
        }
        if self.gitlab.http_timeout_secs == 0 {
            return invalid("gitlab.http_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl ProvisionerConfig {
    /// Checks that only matter when provisioning: account parameters are
    /// written by hand after `init` and must be filled in.
    pub fn require_account(&self) -> Result<()> {
        for (name, value) in [
            ("aws.account_id", &self.aws.account_id),
            ("aws.region", &self.aws.region),
            ("aws.domain_name", &self.aws.domain_name),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::Config(format!("{name} must be set")).into());
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProvisionerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProvisionerConfig> {
    if !path.exists() {
        let cfg = ProvisionerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProvisionerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ProvisionerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
