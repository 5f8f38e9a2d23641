//! Test-only fakes and workspace fixtures.
//!
//! [`ScriptedRunner`] and [`ScriptedApiClient`] stand in for the cluster,
//! terraform, git and GitLab; they record every call so tests can assert on
//! exactly which remote mutations happened.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::error::ProvisionError;
use crate::io::api::{ApiClient, ApiResponse};
use crate::io::config::{ProvisionerConfig, write_config};
use crate::io::init::{InitOptions, ProvisionerPaths, init_provisioner};
use crate::io::process::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec, Terminate};
use crate::io::run_state::RunState;
use crate::pipeline::StepEnv;

pub const TEST_PUBLIC_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ bot@provisioner";

/// Canned result for commands whose display contains `pattern`.
#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    output: CommandOutput,
}

fn output(success: bool, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(if success { 0 } else { 1 }),
        success,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        timed_out: false,
    }
}

/// Records commands and replies from substring rules.
///
/// The most recently added matching rule wins; unmatched commands succeed with
/// empty output. Background spawns return handles that count terminations.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<CommandSpec>>,
    spawned: RefCell<Vec<CommandSpec>>,
    spawn_failure: RefCell<Option<String>>,
    spawns_exit_early: Cell<bool>,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands containing `pattern`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.rules.borrow_mut().push(Rule {
            pattern: pattern.to_string(),
            output: output(true, stdout, ""),
        });
    }

    /// Exit 1 with `stderr` for commands containing `pattern`.
    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.rules.borrow_mut().push(Rule {
            pattern: pattern.to_string(),
            output: output(false, "", stderr),
        });
    }

    /// Make every background spawn fail with `reason`.
    pub fn fail_spawns(&self, reason: &str) {
        *self.spawn_failure.borrow_mut() = Some(reason.to_string());
    }

    /// Make spawned background processes report that they already exited.
    pub fn exit_spawns_early(&self) {
        self.spawns_exit_early.set(true);
    }

    /// Every foreground command run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn displays(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }

    /// First recorded command containing `pattern`.
    pub fn find(&self, pattern: &str) -> Option<CommandSpec> {
        self.calls
            .borrow()
            .iter()
            .find(|spec| spec.display().contains(pattern))
            .cloned()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|spec| spec.display().contains(pattern))
            .count()
    }

    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned.borrow().clone()
    }

    /// Termination signals delivered to spawned background processes.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let display = spec.display();
        let rules = self.rules.borrow();
        let matched = rules.iter().rev().find(|rule| display.contains(&rule.pattern));
        Ok(matched.map_or_else(|| output(true, "", ""), |rule| rule.output.clone()))
    }

    fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundProcess> {
        if let Some(reason) = self.spawn_failure.borrow().as_ref() {
            return Err(ProvisionError::Process {
                program: spec.display(),
                status: "spawn failed".to_string(),
                stderr: reason.clone(),
            }
            .into());
        }
        self.spawned.borrow_mut().push(spec.clone());
        Ok(BackgroundProcess::new(
            spec.display(),
            Box::new(CountingTerminate {
                count: self.terminations.clone(),
                exited: self.spawns_exit_early.get(),
            }),
        ))
    }
}

struct CountingTerminate {
    count: Arc<AtomicUsize>,
    exited: bool,
}

impl Terminate for CountingTerminate {
    fn terminate(&mut self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.exited)
    }
}

/// One recorded form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub fields: Vec<(String, String)>,
}

impl ApiCall {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Replays queued responses; answers `201 Created` once the queue is empty.
#[derive(Default)]
pub struct ScriptedApiClient {
    responses: RefCell<VecDeque<Result<ApiResponse, String>>>,
    calls: RefCell<Vec<ApiCall>>,
}

impl ScriptedApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, status: u16, body: Value) {
        self.responses
            .borrow_mut()
            .push_back(Ok(ApiResponse { status, body }));
    }

    /// Queue a transport failure.
    pub fn push_transport_error(&self, reason: &str) {
        self.responses.borrow_mut().push_back(Err(reason.to_string()));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.borrow().clone()
    }
}

impl ApiClient for ScriptedApiClient {
    fn submit_form(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        fields: &[(&str, &str)],
    ) -> Result<ApiResponse> {
        let owned = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<Vec<_>>()
        };
        self.calls.borrow_mut().push(ApiCall {
            endpoint: endpoint.to_string(),
            query: owned(query),
            fields: owned(fields),
        });
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(reason)) => Err(ProvisionError::Http {
                endpoint: endpoint.to_string(),
                reason,
            }
            .into()),
            None => Ok(ApiResponse {
                status: 201,
                body: Value::Null,
            }),
        }
    }
}

/// Initialized provisioner root in a temp dir with a gitops tree, a bot public
/// key and a local listener standing in for the port-forward.
pub struct TestWorkspace {
    _temp: TempDir,
    _forward_target: TcpListener,
    pub paths: ProvisionerPaths,
    pub config: ProvisionerConfig,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_provisioner(temp.path(), &InitOptions::default())?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let local_port = listener.local_addr()?.port();

        let mut config = ProvisionerConfig::default();
        config.aws.account_id = "123456789012".to_string();
        config.aws.region = "us-east-1".to_string();
        config.aws.domain_name = "example.com".to_string();
        config.softserve.local_port = local_port;
        config.softserve.readiness_timeout_secs = 2;
        config.softserve.poll_interval_millis = 20;
        write_config(&paths.config_path, &config)?;

        for module in ["base", "gitlab"] {
            fs::create_dir_all(paths.resolve(&config.paths.terraform_dir(module)))?;
        }
        fs::write(
            paths.resolve(&config.gitlab.public_key_path),
            format!("{TEST_PUBLIC_KEY}\n"),
        )?;

        Ok(Self {
            _temp: temp,
            _forward_target: listener,
            paths,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn env<'a>(
        &'a self,
        runner: &'a dyn CommandRunner,
        api: &'a dyn ApiClient,
    ) -> StepEnv<'a> {
        StepEnv {
            config: &self.config,
            paths: &self.paths,
            runner,
            api,
        }
    }

    /// Fresh load of the run state from disk.
    pub fn load_state(&self) -> RunState {
        RunState::load(&self.paths.run_state_path)
            .unwrap_or_else(|err| panic!("load run state: {err:#}"))
    }

    /// Write raw JSON as the run state, bypassing the store.
    pub fn write_state(&self, doc: &Value) -> Result<()> {
        let payload = serde_json::to_string_pretty(doc)
            .map_err(|err| anyhow!("serialize state: {err}"))?;
        fs::write(&self.paths.run_state_path, payload)?;
        Ok(())
    }
}
