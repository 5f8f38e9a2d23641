//! Soft-serve bootstrap: admin config repo and initial gitops push.
//!
//! Everything goes through a port-forward to the in-cluster soft-serve ssh
//! service. The forward is held for the duration of the step and terminated
//! on every exit path.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{info, instrument};

use crate::error::ProvisionError;
use crate::io::git::Git;
use crate::io::readiness::wait_for_tcp;
use crate::io::run_state::RunState;
use crate::pipeline::StepEnv;
use crate::secrets::ensure_bot_public_key;

const CONFIG_REPO: &str = "config";
const CONFIG_BRANCH: &str = "master";
const GITOPS_REMOTE: &str = "soft";
const GITOPS_BRANCH: &str = "main";

const CONFIG_TEMPLATE: &str = r"# Managed by provisioner.
name: Soft Serve
host: localhost
port: 22
anon-access: no-access
allow-keyless: false
repos:
  - name: {{ repo_name }}
    repo: {{ repo_name }}
    private: true
    note: gitops repository
users:
  - name: {{ admin_name }}
    admin: true
    public-keys:
      - {{ public_key }}
";

/// Render soft-serve's `config.yaml` with the bot key as the only admin.
pub fn render_config(admin_name: &str, public_key: &str, repo_name: &str) -> Result<String> {
    let env = Environment::new();
    env.render_str(
        CONFIG_TEMPLATE,
        context! { admin_name, public_key, repo_name },
    )
    .context("render soft-serve config")
}

fn ssh_key(env: &StepEnv<'_>) -> Option<PathBuf> {
    env.config
        .softserve
        .ssh_private_key_path
        .as_ref()
        .map(|path| env.paths.resolve(path))
}

#[instrument(skip_all)]
pub fn configure_and_push(env: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
    let public_key = ensure_bot_public_key(env, state)?;
    let soft = &env.config.softserve;

    let mut forward = env
        .kubectl()
        .port_forward(&soft.namespace, &soft.service, soft.local_port, soft.remote_port)
        .context("start soft-serve port-forward")?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, soft.local_port));
    wait_for_tcp(
        "soft-serve port-forward",
        addr,
        soft.readiness_timeout(),
        soft.poll_interval(),
        || forward.ensure_running(),
    )?;

    configure_admin_repo(env, &public_key)?;
    push_gitops(env)?;
    forward.terminate()
}

fn configure_admin_repo(env: &StepEnv<'_>, public_key: &str) -> Result<()> {
    let soft = &env.config.softserve;
    let key = ssh_key(env);
    let dir = &env.paths.softserve_config_dir;
    let git = Git::new(env.runner, &env.config.tools.git, dir).with_ssh_key(key.as_deref());
    git.clone_fresh(&soft.repo_url(CONFIG_REPO))?;

    let rendered = render_config(&soft.admin_name, public_key, &soft.repo_name)?;
    fs::create_dir_all(dir).map_err(|source| ProvisionError::Io {
        op: "create directory",
        path: dir.clone(),
        source,
    })?;
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, rendered).map_err(|source| ProvisionError::Io {
        op: "write",
        path: config_path.clone(),
        source,
    })?;

    git.add_all()?;
    git.commit_staged("configure admin and gitops repository")?;
    git.push_head("origin", CONFIG_BRANCH)?;
    info!(admin = %soft.admin_name, "soft-serve configured");
    Ok(())
}

fn push_gitops(env: &StepEnv<'_>) -> Result<()> {
    let soft = &env.config.softserve;
    let dir = env.paths.resolve(&env.config.paths.gitops_dir);
    if !dir.is_dir() {
        return Err(ProvisionError::Prerequisite(format!(
            "gitops directory {} does not exist",
            dir.display()
        ))
        .into());
    }
    let key = ssh_key(env);
    let git = Git::new(env.runner, &env.config.tools.git, &dir).with_ssh_key(key.as_deref());
    git.ensure_repo()?;
    git.set_remote(GITOPS_REMOTE, &soft.repo_url(&soft.repo_name))?;
    git.add_all()?;
    git.commit_staged("initial gitops content")?;
    git.push_head(GITOPS_REMOTE, GITOPS_BRANCH)?;
    info!(repo = %soft.repo_name, "gitops pushed to soft-serve");
    Ok(())
}
