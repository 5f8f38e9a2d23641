//! Terraform-backed steps: base infrastructure and the GitLab module.
//!
//! Credentials and account parameters reach terraform through env vars on the
//! child process only.

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::core::keys::{GITLAB_TOKEN, VAULT_KMS_KEY_ID};
use crate::error::ProvisionError;
use crate::io::run_state::RunState;
use crate::io::terraform::{Terraform, TerraformAction};
use crate::pipeline::StepEnv;

pub const BASE_MODULE: &str = "base";
pub const GITLAB_MODULE: &str = "gitlab";
const KMS_KEY_OUTPUT: &str = "vault_unseal_kms_key";

fn base_terraform<'a>(env: &StepEnv<'a>) -> Terraform<'a> {
    let aws = &env.config.aws;
    let workdir = env
        .paths
        .resolve(&env.config.paths.terraform_dir(BASE_MODULE));
    Terraform::new(env.runner, &env.config.tools.terraform, workdir)
        .env("TF_VAR_aws_account_id", &aws.account_id)
        .env("TF_VAR_aws_region", &aws.region)
        .env("TF_VAR_hosted_zone_name", &aws.domain_name)
}

fn gitlab_terraform<'a>(env: &StepEnv<'a>, state: &RunState) -> Result<Terraform<'a>> {
    let token = state.get_str(GITLAB_TOKEN).ok_or_else(|| {
        ProvisionError::Prerequisite(format!("{GITLAB_TOKEN} is not set"))
    })?;
    let workdir = env
        .paths
        .resolve(&env.config.paths.terraform_dir(GITLAB_MODULE));
    Ok(
        Terraform::new(env.runner, &env.config.tools.terraform, workdir)
            .env("GITLAB_TOKEN", token)
            .env("GITLAB_BASE_URL", env.config.gitlab_base_url()),
    )
}

/// Apply the base module and capture the vault unseal KMS key id.
pub fn apply_base(env: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
    let terraform = base_terraform(env);
    terraform.init()?;
    terraform.execute(TerraformAction::Apply)?;
    let key_id = terraform.output(KMS_KEY_OUTPUT)?;
    info!(key = VAULT_KMS_KEY_ID, "captured kms key id");
    state.commit(VAULT_KMS_KEY_ID, Value::String(key_id))
}

pub fn apply_gitlab(env: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
    let terraform = gitlab_terraform(env, state)?;
    terraform.init()?;
    terraform.execute(TerraformAction::Apply)
}

pub fn destroy_base(env: &StepEnv<'_>, _state: &RunState) -> Result<()> {
    let terraform = base_terraform(env);
    terraform.init()?;
    terraform.execute(TerraformAction::Destroy)
}

pub fn destroy_gitlab(env: &StepEnv<'_>, state: &RunState) -> Result<()> {
    let terraform = gitlab_terraform(env, state)?;
    terraform.init()?;
    terraform.execute(TerraformAction::Destroy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_kind;
    use crate::test_support::{ScriptedApiClient, ScriptedRunner, TestWorkspace};
    use serde_json::json;

    fn env_value<'a>(spec: &'a crate::io::process::CommandSpec, key: &str) -> Option<&'a str> {
        spec.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn apply_base_runs_terraform_and_captures_kms_key() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        runner.respond("output vault_unseal_kms_key", "\"kms-1234\"\n");
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        apply_base(&env, &mut state).expect("apply");

        assert_eq!(
            runner.displays(),
            vec![
                "terraform init",
                "terraform apply -auto-approve",
                "terraform output vault_unseal_kms_key",
            ]
        );
        let apply = runner.find("apply").expect("apply call");
        assert_eq!(env_value(&apply, "TF_VAR_aws_account_id"), Some("123456789012"));
        assert_eq!(env_value(&apply, "TF_VAR_aws_region"), Some("us-east-1"));
        assert_eq!(env_value(&apply, "TF_VAR_hosted_zone_name"), Some("example.com"));
        assert!(
            apply
                .workdir
                .as_ref()
                .expect("workdir")
                .ends_with("gitops/terraform/base")
        );
        assert_eq!(ws.load_state().get_str(VAULT_KMS_KEY_ID), Some("kms-1234"));
    }

    /// The KMS key id is read only after a successful apply.
    #[test]
    fn failed_apply_captures_nothing() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        runner.fail("apply", "Error: quota exceeded");
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let err = apply_base(&env, &mut state).unwrap_err();
        assert_eq!(find_kind(&err).expect("kind").kind(), "process");
        assert!(format!("{err:#}").contains("quota exceeded"));
        assert_eq!(runner.count("output"), 0);
        assert!(ws.load_state().get(VAULT_KMS_KEY_ID).is_none());
    }

    #[test]
    fn empty_kms_output_is_prerequisite_error() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        runner.respond("output vault_unseal_kms_key", "\"\"\n");
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let err = apply_base(&env, &mut state).unwrap_err();
        assert_eq!(find_kind(&err).expect("kind").kind(), "prerequisite");
    }

    #[test]
    fn apply_gitlab_passes_token_and_base_url() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();
        state.commit(GITLAB_TOKEN, json!("tok-abc")).expect("commit");

        apply_gitlab(&env, &mut state).expect("apply");
        let apply = runner.find("apply").expect("apply call");
        assert_eq!(env_value(&apply, "GITLAB_TOKEN"), Some("tok-abc"));
        assert_eq!(
            env_value(&apply, "GITLAB_BASE_URL"),
            Some("https://gitlab.example.com")
        );
        assert!(
            apply
                .workdir
                .as_ref()
                .expect("workdir")
                .ends_with("gitops/terraform/gitlab")
        );
    }

    #[test]
    fn apply_gitlab_without_token_runs_nothing() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let err = apply_gitlab(&env, &mut state).unwrap_err();
        assert_eq!(find_kind(&err).expect("kind").kind(), "prerequisite");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn destroy_uses_destroy_action() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let state = ws.load_state();

        destroy_base(&env, &state).expect("destroy");
        assert_eq!(runner.count("terraform destroy -auto-approve"), 1);
        assert_eq!(runner.count("apply"), 0);
    }
}
