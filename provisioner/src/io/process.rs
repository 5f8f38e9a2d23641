//! External command runner.
//!
//! Foreground commands run with a timeout and bounded output capture. The one
//! background helper (a port-forward) is owned by a [`BackgroundProcess`]
//! handle that delivers its termination signal exactly once, on whichever exit
//! path the owning step takes.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::ProvisionError;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const REDACTED: &str = "<redacted>";

/// A command to run: program, positional args, working directory and env.
///
/// Env vars apply to the child only; the orchestrator's own environment is
/// never modified. Values registered with [`CommandSpec::redact`] are masked
/// in [`CommandSpec::display`], which feeds every log line and error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    redacted: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            redacted: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Mask `secret` wherever it appears in [`CommandSpec::display`].
    ///
    /// The child still receives the real value.
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redacted.push(secret);
        }
        self
    }

    /// `program arg1 arg2` for logs and error messages, secrets masked.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        self.mask(&out)
    }

    /// Replace every redacted value in `text`.
    pub fn mask(&self, text: &str) -> String {
        self.redacted
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// Fail with an `Io` error if the working directory is missing.
    pub fn ensure_workdir(&self) -> Result<()> {
        let Some(dir) = &self.workdir else {
            return Ok(());
        };
        if dir.is_dir() {
            return Ok(());
        }
        Err(ProvisionError::Io {
            op: "change directory",
            path: dir.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory"),
        }
        .into())
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Captured child process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            stdout,
            stderr,
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    fn status_label(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        match self.code {
            Some(code) => format!("exit {code}"),
            None => "killed by signal".to_string(),
        }
    }
}

/// Abstraction over process execution so steps can run against scripted fakes.
pub trait CommandRunner {
    /// Run to completion and capture output. Only spawn/wait failures are errors;
    /// a non-zero exit is reported in the output.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start a long-running helper detached from the caller.
    fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundProcess>;
}

/// Run a command and turn a non-zero exit or timeout into a `Process` error.
pub fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    spec.ensure_workdir()?;
    let output = runner
        .run(spec)
        .with_context(|| format!("run {}", spec.display()))?;
    if output.success && !output.timed_out {
        return Ok(output);
    }
    warn!(command = %spec.display(), status = %output.status_label(), "command failed");
    Err(ProvisionError::Process {
        program: spec.display(),
        status: output.status_label(),
        stderr: spec.mask(&stderr_tail(&output.stderr, 20)),
    }
    .into())
}

fn stderr_tail(stderr: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n").trim().to_string()
}

/// Runner that spawns real processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(command = %spec.program))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        spec.ensure_workdir()?;
        let env_keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
        debug!(command = %spec.display(), ?env_keys, "running command");
        run_command_with_timeout(spec.to_command(), self.timeout, self.output_limit_bytes)
            .map_err(|err| {
                anyhow::Error::new(ProvisionError::Process {
                    program: spec.display(),
                    status: "could not run".to_string(),
                    stderr: spec.mask(&format!("{err:#}")),
                })
            })
    }

    fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundProcess> {
        spec.ensure_workdir()?;
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let child = cmd.spawn().map_err(|err| ProvisionError::Process {
            program: spec.display(),
            status: "spawn failed".to_string(),
            stderr: err.to_string(),
        })?;
        info!(command = %spec.display(), pid = child.id(), "started background process");
        Ok(BackgroundProcess::new(spec.display(), Box::new(child)))
    }
}

/// Something that can be told to stop.
pub trait Terminate: Send {
    fn terminate(&mut self) -> Result<()>;

    /// Whether the process already exited on its own.
    fn has_exited(&mut self) -> Result<bool> {
        Ok(false)
    }
}

impl Terminate for Child {
    /// SIGTERM, then reap; SIGKILL if the child outlives the grace period.
    fn terminate(&mut self) -> Result<()> {
        if self.try_wait().context("poll background process")?.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.id()).context("child pid out of range")?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(anyhow!("send SIGTERM to {pid}: {err}")),
        }
        if self
            .wait_timeout(TERMINATE_GRACE)
            .context("wait for background process")?
            .is_none()
        {
            warn!(pid, "background process ignored SIGTERM, killing");
            self.kill().context("kill background process")?;
            self.wait().context("reap background process")?;
        }
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.try_wait().context("poll background process")?.is_some())
    }
}

/// Scoped owner of a background process.
///
/// The termination signal is sent once: by [`BackgroundProcess::terminate`] or,
/// failing that, when the handle is dropped.
pub struct BackgroundProcess {
    label: String,
    handle: Option<Box<dyn Terminate>>,
}

impl BackgroundProcess {
    pub fn new(label: impl Into<String>, handle: Box<dyn Terminate>) -> Self {
        Self {
            label: label.into(),
            handle: Some(handle),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Fail with a `Process` error if the process has already exited, e.g. a
    /// port-forward that could not bind its local port.
    pub fn ensure_running(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        if !handle.has_exited()? {
            return Ok(());
        }
        warn!(process = %self.label, "background process exited early");
        Err(ProvisionError::Process {
            program: self.label.clone(),
            status: "exited early".to_string(),
            stderr: "background process stopped before it was used".to_string(),
        }
        .into())
    }

    /// Stop the process now and surface any signalling error.
    pub fn terminate(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        info!(process = %self.label, "terminating background process");
        handle.terminate()
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(process = %self.label, err = %format!("{err:#}"), "failed to terminate background process");
        }
    }
}

impl std::fmt::Debug for BackgroundProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("label", &self.label)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        stdout_truncated,
        stderr_truncated,
        timed_out,
        ..CommandOutput::from_status(status, stdout, stderr)
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner() -> ProcessRunner {
        ProcessRunner {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
        }
    }

    #[test]
    fn captures_stdout_stderr_and_scoped_env() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"$PROVISIONER_TEST_VAR\"; echo oops >&2"])
            .env("PROVISIONER_TEST_VAR", "scoped");
        let output = runner().run(&spec).expect("run");
        assert!(output.success);
        assert_eq!(output.stdout_string(), "scoped\n");
        assert_eq!(output.stderr_string(), "oops\n");
        assert!(std::env::var("PROVISIONER_TEST_VAR").is_err());
    }

    #[test]
    fn runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let spec = CommandSpec::new("ls").workdir(temp.path());
        let output = runner().run(&spec).expect("run");
        assert!(output.stdout_string().contains("marker.txt"));
    }

    #[test]
    fn run_checked_reports_exit_code_and_stderr() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = run_checked(&runner(), &spec).unwrap_err();
        let kind = crate::error::find_kind(&err).expect("kind");
        assert_eq!(kind.kind(), "process");
        let msg = format!("{err:#}");
        assert!(msg.contains("exit 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    /// A failing command carrying a secret must not echo it into the error
    /// chain, while the child still sees the real argument.
    #[test]
    fn redacted_values_are_masked_in_errors() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"got $0\" >&2; exit 2", "hunter2-token"])
            .redact("hunter2-token");
        assert_eq!(spec.display(), "sh -c echo \"got $0\" >&2; exit 2 <redacted>");

        let err = run_checked(&runner(), &spec).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("exit 2"), "{msg}");
        assert!(msg.contains("<redacted>"), "{msg}");
        assert!(msg.contains("got <redacted>"), "{msg}");
        assert!(!msg.contains("hunter2-token"), "{msg}");
    }

    #[test]
    fn missing_workdir_is_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("true").workdir(temp.path().join("missing"));
        let err = run_checked(&runner(), &spec).unwrap_err();
        assert_eq!(crate::error::find_kind(&err).expect("kind").kind(), "io");
    }

    #[test]
    fn spawn_failure_is_process_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4711");
        let err = runner().run(&spec).unwrap_err();
        assert_eq!(
            crate::error::find_kind(&err).expect("kind").kind(),
            "process"
        );
    }

    #[test]
    fn times_out_and_kills() {
        let fast = ProcessRunner {
            timeout: Duration::from_millis(200),
            output_limit_bytes: 1_000,
        };
        let output = fast
            .run(&CommandSpec::new("sleep").arg("5"))
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let small = ProcessRunner {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 4,
        };
        let output = small
            .run(&CommandSpec::new("sh").args(["-c", "printf 0123456789"]))
            .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    struct CountingHandle(Arc<AtomicUsize>);

    impl Terminate for CountingHandle {
        fn terminate(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn background_process_terminates_once_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let _proc = BackgroundProcess::new("helper", Box::new(CountingHandle(count.clone())));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_terminate_does_not_signal_again_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let proc = BackgroundProcess::new("helper", Box::new(CountingHandle(count.clone())));
        proc.terminate().expect("terminate");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exited_background_process_fails_ensure_running() {
        let mut proc = runner()
            .spawn_background(&CommandSpec::new("sh").args(["-c", "exit 1"]))
            .expect("spawn");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let err = loop {
            match proc.ensure_running() {
                Err(err) => break err,
                Ok(()) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                Ok(()) => panic!("helper never exited"),
            }
        };
        assert!(format!("{err:#}").contains("exited early"));
        proc.terminate().expect("terminate after exit");
    }

    #[test]
    fn real_background_process_is_stopped() {
        let mut proc = runner()
            .spawn_background(&CommandSpec::new("sleep").arg("30"))
            .expect("spawn");
        assert!(format!("{proc:?}").contains("running: true"));
        proc.ensure_running().expect("still running");
        proc.terminate().expect("terminate");
    }
}
