//! Terraform adapter.
//!
//! Every invocation runs in the module directory with the caller's env vars
//! attached to the child process only.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use super::process::{CommandRunner, CommandSpec, run_checked};
use crate::core::secret::strip_quoting;
use crate::error::ProvisionError;

/// `apply` or `destroy`, both with `-auto-approve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformAction {
    Apply,
    Destroy,
}

impl TerraformAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TerraformAction::Apply => "apply",
            TerraformAction::Destroy => "destroy",
        }
    }
}

/// Wrapper for running terraform in one module directory.
pub struct Terraform<'a> {
    runner: &'a dyn CommandRunner,
    binary: String,
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

impl<'a> Terraform<'a> {
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn init(&self) -> Result<()> {
        self.run(&["init"]).context("terraform init")?;
        Ok(())
    }

    #[instrument(skip_all, fields(action = action.as_str(), workdir = %self.workdir.display()))]
    pub fn execute(&self, action: TerraformAction) -> Result<()> {
        info!("running terraform {}", action.as_str());
        self.run(&[action.as_str(), "-auto-approve"])
            .with_context(|| format!("terraform {}", action.as_str()))?;
        Ok(())
    }

    /// Read a single output value (trimmed, quotes stripped, non-empty).
    pub fn output(&self, name: &str) -> Result<String> {
        let stdout = self
            .run(&["output", name])
            .with_context(|| format!("terraform output {name}"))?;
        let value = strip_quoting(&stdout);
        if value.is_empty() {
            return Err(ProvisionError::Prerequisite(format!(
                "terraform output {name} is empty"
            ))
            .into());
        }
        Ok(value)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut spec = CommandSpec::new(&self.binary)
            .args(args.iter().copied())
            .workdir(&self.workdir);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        let output = run_checked(self.runner, &spec)?;
        Ok(output.stdout_string())
    }
}
