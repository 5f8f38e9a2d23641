//! GitLab steps: access tokens and bot key registration.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::keys::GITLAB_TOKEN;
use crate::error::ProvisionError;
use crate::io::run_state::RunState;
use crate::pipeline::StepEnv;
use crate::secrets::{ensure_bot_public_key, ensure_gitlab_token, ensure_runner_token};

const ALREADY_TAKEN: &str = "has already been taken";

/// Ensure the admin API token and the runner registration token.
pub fn provision_tokens(env: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
    let token = ensure_gitlab_token(env, state)?;
    let runner_token = ensure_runner_token(env, state)?;
    info!(
        token_len = token.len(),
        runner_token_len = runner_token.len(),
        "gitlab tokens ready"
    );
    Ok(())
}

/// Register the bot public key on the GitLab root user.
///
/// A 400 saying the key is already taken means an earlier run uploaded it
/// but crashed before recording the flag; that counts as done.
pub fn upload_key(env: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
    let token = state
        .get_str(GITLAB_TOKEN)
        .ok_or_else(|| ProvisionError::Prerequisite(format!("{GITLAB_TOKEN} is not set")))?
        .to_string();
    let public_key = ensure_bot_public_key(env, state)?;
    let endpoint = format!("{}/api/v4/user/keys", env.config.gitlab_base_url());

    info!(endpoint = %endpoint, "uploading bot public key");
    let response = env.api.submit_form(
        &endpoint,
        &[("private_token", token.as_str())],
        &[
            ("title", env.config.gitlab.key_title.as_str()),
            ("key", public_key.as_str()),
        ],
    )?;
    info!(status = response.status, body = %response.body, "gitlab responded");

    match response.status {
        201 => Ok(()),
        400 if response.body_mentions(ALREADY_TAKEN) => {
            warn!("bot public key already registered");
            Ok(())
        }
        status => Err(ProvisionError::Http {
            endpoint,
            reason: format!("key upload rejected with status {status}: {}", response.body),
        }
        .into()),
    }
}
