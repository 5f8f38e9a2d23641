//! Git adapter for seeding repositories.
//!
//! Commits are made with a fixed bot identity so seeding works on machines
//! without a global git config. Commands go through the [`CommandRunner`] so
//! tests observe them without touching a remote.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use super::process::{CommandRunner, CommandSpec, run_checked};

const BOT_NAME: &str = "provisioner-bot";
const BOT_EMAIL: &str = "provisioner-bot@localhost";

/// Wrapper for executing git commands in a working directory.
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
    binary: String,
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

impl<'a> Git<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        binary: impl Into<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            workdir: workdir.into(),
            env: Vec::new(),
        }
    }

    /// Route ssh through a specific key and skip interactive host-key prompts.
    pub fn with_ssh_key(mut self, private_key: Option<&Path>) -> Self {
        let mut command = String::from(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        );
        if let Some(key) = private_key {
            command.push_str(&format!(" -i {}", key.display()));
        }
        self.env.push(("GIT_SSH_COMMAND".to_string(), command));
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// `git init` unless the directory is already a repository.
    pub fn ensure_repo(&self) -> Result<()> {
        if self.is_repo() {
            return Ok(());
        }
        debug!(workdir = %self.workdir.display(), "initializing repository");
        self.run_checked(&["init"])?;
        Ok(())
    }

    /// Clone `url` into this wrapper's workdir, replacing any stale clone.
    #[instrument(skip_all, fields(url))]
    pub fn clone_fresh(&self, url: &str) -> Result<()> {
        if self.workdir.exists() {
            std::fs::remove_dir_all(&self.workdir)
                .with_context(|| format!("remove stale clone {}", self.workdir.display()))?;
        }
        let parent = self
            .workdir
            .parent()
            .with_context(|| format!("clone path missing parent {}", self.workdir.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let target = self.workdir.display().to_string();
        let spec = self.spec(&["clone", url, &target]).workdir(parent);
        run_checked(self.runner, &spec)?;
        info!(url, "cloned repository");
        Ok(())
    }

    /// Point `name` at `url`, adding the remote if missing.
    pub fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        let remotes = self.run_capture(&["remote"])?;
        if remotes.lines().any(|line| line.trim() == name) {
            self.run_checked(&["remote", "set-url", name, url])?;
        } else {
            self.run_checked(&["remote", "add", name, url])?;
        }
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        let name = format!("user.name={BOT_NAME}");
        let email = format!("user.email={BOT_EMAIL}");
        self.run_checked(&["-c", &name, "-c", &email, "commit", "-m", message])?;
        Ok(true)
    }

    /// Push the current HEAD to `branch` on `remote`.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_head(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        info!(remote, branch, "pushed");
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<super::process::CommandOutput> {
        let spec = self.spec(args).workdir(&self.workdir);
        run_checked(self.runner, &spec).with_context(|| format!("git {}", args.join(" ")))
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary).args(args.iter().copied());
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        spec
    }
}
