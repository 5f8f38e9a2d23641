//! Cluster client adapter.
//!
//! Thin builders around `kubectl --kubeconfig <path> -n <namespace> ...`.

use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use super::process::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec, run_checked};

pub struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    binary: String,
    kubeconfig: PathBuf,
}

impl<'a> Kubectl<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        binary: impl Into<String>,
        kubeconfig: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    /// `get <resource...> -o jsonpath='<template>'`, returning raw stdout.
    ///
    /// The template is passed with its single quotes, so the output carries
    /// them too; callers strip them.
    pub fn get_jsonpath(&self, namespace: &str, resource: &[&str], template: &str) -> Result<String> {
        let spec = self
            .base(namespace)
            .arg("get")
            .args(resource.iter().copied())
            .arg("-o")
            .arg(format!("jsonpath='{template}'"));
        let output = run_checked(self.runner, &spec)?;
        debug!(namespace, ?resource, bytes = output.stdout.len(), "jsonpath fetched");
        Ok(output.stdout_string())
    }

    /// `exec <pod> -- <command...>`, masking `secrets` in logs and errors.
    pub fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[&str],
        secrets: &[&str],
    ) -> Result<CommandOutput> {
        let spec = secrets.iter().fold(
            self.base(namespace)
                .arg("exec")
                .arg(pod)
                .arg("--")
                .args(command.iter().copied()),
            |spec, secret| spec.redact(*secret),
        );
        run_checked(self.runner, &spec)
    }

    /// `port-forward <service> <local>:<remote>` as a background process.
    pub fn port_forward(
        &self,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<BackgroundProcess> {
        let spec = self
            .base(namespace)
            .arg("port-forward")
            .arg(service)
            .arg(format!("{local_port}:{remote_port}"));
        self.runner.spawn_background(&spec)
    }

    fn base(&self, namespace: &str) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .arg("--kubeconfig")
            .arg(self.kubeconfig.display().to_string())
            .arg("-n")
            .arg(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn get_jsonpath_quotes_template_and_scopes_namespace() {
        let runner = ScriptedRunner::new();
        runner.respond("get pod", "'toolbox-0'");
        let kubectl = Kubectl::new(&runner, "kubectl", "/work/kubeconfig");

        let out = kubectl
            .get_jsonpath("gitlab", &["pod", "-lapp=toolbox"], "{.items[0].metadata.name}")
            .expect("get");
        assert_eq!(out, "'toolbox-0'");
        assert_eq!(
            runner.displays(),
            vec![
                "kubectl --kubeconfig /work/kubeconfig -n gitlab get pod -lapp=toolbox \
                 -o jsonpath='{.items[0].metadata.name}'"
            ]
        );
    }

    #[test]
    fn exec_failure_is_process_error() {
        let runner = ScriptedRunner::new();
        runner.fail("exec", "pod not found");
        let kubectl = Kubectl::new(&runner, "kubectl", "kubeconfig");

        let err = kubectl
            .exec("gitlab", "toolbox-0", &["gitlab-rails", "runner", "puts 1"], &[])
            .unwrap_err();
        assert_eq!(crate::error::find_kind(&err).expect("kind").kind(), "process");
        assert!(
            runner.displays()[0].ends_with("exec toolbox-0 -- gitlab-rails runner puts 1")
        );
    }

    #[test]
    fn exec_masks_secrets_in_error_but_passes_them_through() {
        let runner = ScriptedRunner::new();
        runner.fail("exec", "undefined method for 'tok-123'");
        let kubectl = Kubectl::new(&runner, "kubectl", "kubeconfig");

        let err = kubectl
            .exec("gitlab", "toolbox-0", &["gitlab-rails", "runner", "set('tok-123')"], &["tok-123"])
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(!msg.contains("tok-123"), "{msg}");
        assert!(msg.contains("set('<redacted>')"), "{msg}");
        assert_eq!(runner.calls()[0].args.last().map(String::as_str), Some("set('tok-123')"));
    }

    #[test]
    fn port_forward_spawns_in_background() {
        let runner = ScriptedRunner::new();
        let kubectl = Kubectl::new(&runner, "kubectl", "kubeconfig");

        let forward = kubectl
            .port_forward("soft-serve", "svc/soft-serve", 8022, 22)
            .expect("spawn");
        assert!(forward.label().ends_with("port-forward svc/soft-serve 8022:22"));
        assert!(runner.calls().is_empty());
        drop(forward);
        assert_eq!(runner.terminations(), 1);
    }
}
