//! Teardown of terraform-managed infrastructure.
//!
//! Runs in reverse creation order and only for steps whose flag is set. A flag
//! is cleared once its destroy succeeds, so an interrupted teardown resumes
//! where it stopped.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::keys::{BASE_APPLIED, GITLAB_APPLIED};
use crate::core::types::{GuardOutcome, StepReport};
use crate::io::run_state::RunState;
use crate::pipeline::{PipelineReport, StepEnv};
use crate::steps::infra;

type TeardownFn = fn(&StepEnv<'_>, &RunState) -> Result<()>;

struct TeardownStep {
    key: &'static str,
    name: &'static str,
    run: TeardownFn,
}

const TEARDOWN: &[TeardownStep] = &[
    TeardownStep {
        key: GITLAB_APPLIED,
        name: "destroy gitlab terraform",
        run: infra::destroy_gitlab,
    },
    TeardownStep {
        key: BASE_APPLIED,
        name: "destroy base terraform",
        run: infra::destroy_base,
    },
];

/// Destroy applied modules, newest first.
///
/// Outcomes reuse [`GuardOutcome`]: `Skipped` when nothing was applied,
/// `Completed` when the module was destroyed and its flag cleared.
#[instrument(skip_all, fields(dry_run))]
pub fn run_destroy(env: &StepEnv<'_>, state: &mut RunState, dry_run: bool) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();
    for step in TEARDOWN {
        let outcome = if !state.get_bool(step.key) {
            info!("skipping {}: not applied", step.key);
            GuardOutcome::Skipped
        } else if dry_run {
            info!("[dry-run] {} skipped", step.name);
            GuardOutcome::DryRun
        } else {
            info!("executing {}", step.name);
            (step.run)(env, state).with_context(|| format!("{} ({})", step.name, step.key))?;
            state
                .commit_remove(step.key)
                .with_context(|| format!("clear {}", step.key))?;
            info!("cleared {}", step.key);
            GuardOutcome::Completed
        };
        report.steps.push(StepReport {
            key: step.key,
            name: step.name,
            outcome,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keys::GITLAB_TOKEN;
    use crate::test_support::{ScriptedApiClient, ScriptedRunner, TestWorkspace};
    use serde_json::json;

    fn applied_state(ws: &TestWorkspace) -> RunState {
        let mut state = ws.load_state();
        state.commit(BASE_APPLIED, json!(true)).expect("base");
        state.commit(GITLAB_APPLIED, json!(true)).expect("gitlab");
        state.commit(GITLAB_TOKEN, json!("tok-abc")).expect("token");
        state
    }

    #[test]
    fn destroys_in_reverse_order_and_clears_flags() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = applied_state(&ws);

        let report = run_destroy(&env, &mut state, false).expect("destroy");
        assert_eq!(report.count(GuardOutcome::Completed), 2);

        let workdirs: Vec<String> = runner
            .calls()
            .iter()
            .filter(|spec| spec.display().contains("destroy"))
            .map(|spec| spec.workdir.as_ref().expect("workdir").display().to_string())
            .collect();
        assert_eq!(workdirs.len(), 2);
        assert!(workdirs[0].ends_with("terraform/gitlab"));
        assert!(workdirs[1].ends_with("terraform/base"));

        let reloaded = ws.load_state();
        assert!(!reloaded.get_bool(BASE_APPLIED));
        assert!(!reloaded.get_bool(GITLAB_APPLIED));
        assert_eq!(reloaded.get_str(GITLAB_TOKEN), Some("tok-abc"));
    }

    #[test]
    fn dry_run_changes_nothing() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = applied_state(&ws);

        let report = run_destroy(&env, &mut state, true).expect("dry run");
        assert_eq!(report.count(GuardOutcome::DryRun), 2);
        assert!(runner.calls().is_empty());
        assert!(ws.load_state().get_bool(BASE_APPLIED));
    }

    #[test]
    fn unapplied_modules_are_skipped() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();
        state.commit(BASE_APPLIED, json!(true)).expect("base");

        let report = run_destroy(&env, &mut state, false).expect("destroy");
        assert_eq!(report.steps[0].outcome, GuardOutcome::Skipped);
        assert_eq!(report.steps[1].outcome, GuardOutcome::Completed);
        assert_eq!(runner.count("destroy"), 1);
    }

    #[test]
    fn failed_destroy_keeps_flag_and_stops() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        runner.fail("destroy", "Error: resource in use");
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = applied_state(&ws);

        run_destroy(&env, &mut state, false).unwrap_err();
        let reloaded = ws.load_state();
        assert!(reloaded.get_bool(GITLAB_APPLIED));
        assert!(reloaded.get_bool(BASE_APPLIED));
        assert_eq!(runner.count("destroy"), 1);
    }
}
