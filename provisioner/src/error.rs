//! Error kinds surfaced by provisioning operations.
//!
//! Operations return `anyhow::Result` so callers can attach context naming the
//! failing operation. The root cause is one of these kinds, which `main`
//! recovers with `downcast_ref` to report how the run failed.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Local filesystem failure (working directory, state file, key file).
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A captured secret could not be decoded.
    #[error("decode {key}: {reason}")]
    Decode { key: String, reason: String },

    /// An external process failed to spawn, exited non-zero or timed out.
    #[error("{program} failed ({status}): {stderr}")]
    Process {
        program: String,
        status: String,
        stderr: String,
    },

    /// Transport failure or rejected request against a remote API.
    #[error("http {endpoint}: {reason}")]
    Http { endpoint: String, reason: String },

    /// A background helper never became reachable.
    #[error("{what} not ready after {waited_secs}s")]
    Readiness { what: String, waited_secs: u64 },

    /// A step ran without something an earlier step should have produced.
    #[error("{0}")]
    Prerequisite(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Short stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Io { .. } => "io",
            ProvisionError::Decode { .. } => "decode",
            ProvisionError::Process { .. } => "process",
            ProvisionError::Http { .. } => "http",
            ProvisionError::Readiness { .. } => "readiness",
            ProvisionError::Prerequisite(_) => "prerequisite",
            ProvisionError::Config(_) => "config",
        }
    }
}

/// Find the first `ProvisionError` in an error chain.
pub fn find_kind(err: &anyhow::Error) -> Option<&ProvisionError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ProvisionError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn find_kind_sees_through_context() {
        let err = Err::<(), _>(ProvisionError::Decode {
            key: "gitlab.runnertoken".to_string(),
            reason: "invalid base64".to_string(),
        })
        .context("ensure runner token")
        .context("step create.gitlab.tokens")
        .unwrap_err();

        let kind = find_kind(&err).expect("kind");
        assert_eq!(kind.kind(), "decode");
        assert!(format!("{err:#}").contains("invalid base64"));
    }

    #[test]
    fn find_kind_is_none_for_plain_errors() {
        let err = anyhow::anyhow!("boom");
        assert!(find_kind(&err).is_none());
    }
}
