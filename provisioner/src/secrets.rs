//! Secret provisioning: GitLab tokens and the bot public key.
//!
//! Each secret is created or fetched at most once. A value already present in
//! the run state is returned as-is; otherwise it is acquired, checked to be
//! non-empty and persisted before it is handed back. Secret values are never
//! logged, only their length.

use std::fs;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::core::keys::{BOT_PUBLIC_KEY, GITLAB_RUNNER_TOKEN, GITLAB_TOKEN};
use crate::core::secret::{decode_base64_secret, strip_quoting, truncate_token};
use crate::error::ProvisionError;
use crate::io::run_state::RunState;
use crate::pipeline::StepEnv;

/// Return the secret under `key`, acquiring and persisting it if absent.
///
/// `acquire` runs only when the key is missing or empty. Nothing is written if
/// it fails or yields an empty value.
pub fn ensure_secret<F>(state: &mut RunState, key: &str, acquire: F) -> Result<String>
where
    F: FnOnce() -> Result<String>,
{
    if let Some(existing) = state.get_str(key) {
        debug!(key, "secret already present");
        return Ok(existing.to_string());
    }
    let value = acquire()?;
    if value.trim().is_empty() {
        return Err(ProvisionError::Decode {
            key: key.to_string(),
            reason: "acquired value is empty".to_string(),
        }
        .into());
    }
    state
        .commit(key, Value::String(value.clone()))
        .with_context(|| format!("persist {key}"))?;
    info!(key, len = value.len(), "secret stored");
    Ok(value)
}

/// Ruby snippet run through `gitlab-rails runner` to register `token` for root.
fn token_script(token: &str) -> String {
    format!(
        "token = User.find_by_username('root').personal_access_tokens.create(\
         scopes: [:write_registry, :write_repository, :api], name: 'Automation token'); \
         token.set_token('{token}'); token.save!"
    )
}

/// Name of the first toolbox pod in the GitLab namespace.
fn toolbox_pod(env: &StepEnv<'_>) -> Result<String> {
    let gitlab = &env.config.gitlab;
    let raw = env.kubectl().get_jsonpath(
        &gitlab.namespace,
        &["pod", &format!("-l{}", gitlab.toolbox_selector)],
        "{.items[0].metadata.name}",
    )?;
    let pod = strip_quoting(&raw);
    if pod.is_empty() {
        return Err(ProvisionError::Prerequisite(format!(
            "no pod matches {} in namespace {}",
            gitlab.toolbox_selector, gitlab.namespace
        ))
        .into());
    }
    Ok(pod)
}

/// Admin API token, generated locally and registered inside the cluster.
///
/// The token is stored only after the registration command succeeds, so a
/// failed registration never leaves an unusable token behind.
#[instrument(skip_all)]
pub fn ensure_gitlab_token(env: &StepEnv<'_>, state: &mut RunState) -> Result<String> {
    ensure_secret(state, GITLAB_TOKEN, || {
        let token = truncate_token(&Uuid::new_v4().to_string(), env.config.gitlab.token_length)
            .map_err(|reason| ProvisionError::Decode {
                key: GITLAB_TOKEN.to_string(),
                reason,
            })?;
        let pod = toolbox_pod(env)?;
        info!(pod, "registering automation token");
        let script = token_script(&token);
        env.kubectl()
            .exec(
                &env.config.gitlab.namespace,
                &pod,
                &["gitlab-rails", "runner", &script],
                &[token.as_str()],
            )
            .context("register automation token")?;
        Ok(token)
    })
}

/// Runner registration token, read from the cluster secret and base64-decoded.
#[instrument(skip_all)]
pub fn ensure_runner_token(env: &StepEnv<'_>, state: &mut RunState) -> Result<String> {
    ensure_secret(state, GITLAB_RUNNER_TOKEN, || {
        let gitlab = &env.config.gitlab;
        let raw = env
            .kubectl()
            .get_jsonpath(
                &gitlab.namespace,
                &["secret", &gitlab.runner_secret],
                "{.data.runner-registration-token}",
            )
            .context("read runner registration secret")?;
        let token = decode_base64_secret(&raw).map_err(|reason| ProvisionError::Decode {
            key: GITLAB_RUNNER_TOKEN.to_string(),
            reason,
        })?;
        Ok(token)
    })
}

/// Public half of the bot SSH key, read from disk on first use.
#[instrument(skip_all)]
pub fn ensure_bot_public_key(env: &StepEnv<'_>, state: &mut RunState) -> Result<String> {
    ensure_secret(state, BOT_PUBLIC_KEY, || {
        let path = env.paths.resolve(&env.config.gitlab.public_key_path);
        let raw = fs::read_to_string(&path).map_err(|source| ProvisionError::Io {
            op: "read public key",
            path: path.clone(),
            source,
        })?;
        Ok(raw.trim().to_string())
    })
}
