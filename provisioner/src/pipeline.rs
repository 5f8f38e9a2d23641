//! Pipeline driver.
//!
//! The pipeline is an ordered list of [`StepDescriptor`]s. The driver checks the
//! order once, then runs each step under the guard strictly in sequence; no step
//! starts before the previous step's flag has been flushed.

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::plan::{PlanEntry, validate_order};
use crate::core::types::{GuardOutcome, StepReport};
use crate::error::ProvisionError;
use crate::guard::guard_step;
use crate::io::api::ApiClient;
use crate::io::config::ProvisionerConfig;
use crate::io::init::ProvisionerPaths;
use crate::io::kubectl::Kubectl;
use crate::io::process::CommandRunner;
use crate::io::run_state::RunState;

/// Everything a step body may use besides the run state.
///
/// Built once at startup; components never reach for global settings.
pub struct StepEnv<'a> {
    pub config: &'a ProvisionerConfig,
    pub paths: &'a ProvisionerPaths,
    pub runner: &'a dyn CommandRunner,
    pub api: &'a dyn ApiClient,
}

impl StepEnv<'_> {
    pub fn kubectl(&self) -> Kubectl<'_> {
        Kubectl::new(
            self.runner,
            &self.config.tools.kubectl,
            self.paths.resolve(&self.config.tools.kubeconfig),
        )
    }
}

pub type StepFn = fn(&StepEnv<'_>, &mut RunState) -> Result<()>;

/// One guarded unit of the pipeline.
#[derive(Clone, Copy)]
pub struct StepDescriptor {
    /// Completion flag key.
    pub key: &'static str,
    pub name: &'static str,
    /// Flags that must already be set when this step runs.
    pub requires: &'static [&'static str],
    pub run: StepFn,
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Per-step outcomes of one pipeline run, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineReport {
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    pub fn count(&self, outcome: GuardOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Check that keys are unique and well formed and predecessors come first.
pub fn validate_steps(steps: &[StepDescriptor]) -> Result<()> {
    let entries: Vec<PlanEntry<'_>> = steps
        .iter()
        .map(|step| PlanEntry {
            key: step.key,
            requires: step.requires,
        })
        .collect();
    let errors = validate_order(&entries);
    if !errors.is_empty() {
        return Err(anyhow!("invalid pipeline:\n- {}", errors.join("\n- ")));
    }
    Ok(())
}

/// Run every step in order. The first failing step halts the pipeline.
#[instrument(skip_all, fields(steps = steps.len(), dry_run))]
pub fn run_pipeline(
    env: &StepEnv<'_>,
    state: &mut RunState,
    steps: &[StepDescriptor],
    dry_run: bool,
) -> Result<PipelineReport> {
    validate_steps(steps)?;
    let mut report = PipelineReport::default();
    for step in steps {
        if !dry_run && !state.get_bool(step.key) {
            ensure_predecessors(state, step)?;
        }
        let outcome = guard_step(state, step.key, dry_run, |state| (step.run)(env, state))
            .with_context(|| format!("step {} ({})", step.key, step.name))?;
        report.steps.push(StepReport {
            key: step.key,
            name: step.name,
            outcome,
        });
    }
    info!(
        completed = report.count(GuardOutcome::Completed),
        skipped = report.count(GuardOutcome::Skipped),
        dry_run = report.count(GuardOutcome::DryRun),
        "pipeline finished"
    );
    Ok(report)
}

fn ensure_predecessors(state: &RunState, step: &StepDescriptor) -> Result<()> {
    let missing: Vec<&str> = step
        .requires
        .iter()
        .copied()
        .filter(|key| !state.get_bool(key))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ProvisionError::Prerequisite(format!(
        "step {} requires {} to be completed first",
        step.key,
        missing.join(", ")
    ))
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedApiClient, ScriptedRunner, TestWorkspace};
    use anyhow::anyhow;
    use serde_json::json;

    fn ok_step(_: &StepEnv<'_>, state: &mut RunState) -> Result<()> {
        state.commit("test.captured", json!("value"))
    }

    fn failing_step(_: &StepEnv<'_>, _: &mut RunState) -> Result<()> {
        Err(anyhow!("remote failure"))
    }

    const FIRST: StepDescriptor = StepDescriptor {
        key: "test.first",
        name: "first",
        requires: &[],
        run: ok_step,
    };
    const SECOND: StepDescriptor = StepDescriptor {
        key: "test.second",
        name: "second",
        requires: &["test.first"],
        run: ok_step,
    };
    const BROKEN: StepDescriptor = StepDescriptor {
        key: "test.broken",
        name: "broken",
        requires: &["test.first"],
        run: failing_step,
    };

    #[test]
    fn runs_steps_in_order_and_reports() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let report = run_pipeline(&env, &mut state, &[FIRST, SECOND], false).expect("run");
        let keys: Vec<&str> = report.steps.iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["test.first", "test.second"]);
        assert_eq!(report.count(GuardOutcome::Completed), 2);

        let reloaded = ws.load_state();
        assert!(reloaded.get_bool("test.first"));
        assert!(reloaded.get_bool("test.second"));
    }

    /// A failure stops the run; flags of earlier steps stay set.
    #[test]
    fn failure_halts_before_later_steps() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let err = run_pipeline(&env, &mut state, &[FIRST, BROKEN, SECOND], false).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("step test.broken (broken)"), "{msg}");
        assert!(msg.contains("remote failure"), "{msg}");

        let reloaded = ws.load_state();
        assert!(reloaded.get_bool("test.first"));
        assert!(!reloaded.get_bool("test.broken"));
        assert!(!reloaded.get_bool("test.second"));
    }

    #[test]
    fn rejects_out_of_order_pipeline_before_running_anything() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let err = run_pipeline(&env, &mut state, &[SECOND, FIRST], false).unwrap_err();
        assert!(err.to_string().contains("invalid pipeline"));
        assert!(!ws.load_state().get_bool("test.second"));
    }

    #[test]
    fn missing_predecessor_flag_is_prerequisite_error() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();
        // Predecessor declared but hand-removed from the list.
        let err = run_pipeline(&env, &mut state, &[SECOND], false).unwrap_err();
        assert!(err.to_string().contains("invalid pipeline"));

        // Same order, predecessor flag cleared by hand after a partial run.
        run_pipeline(&env, &mut state, &[FIRST], false).expect("first");
        state.commit_remove("test.first").expect("reset");
        let err = super::ensure_predecessors(&state, &SECOND).unwrap_err();
        assert_eq!(
            crate::error::find_kind(&err).expect("kind").kind(),
            "prerequisite"
        );
    }

    /// Predecessors are unmet in a dry run from empty state; that must not
    /// stop the preview.
    #[test]
    fn dry_run_skips_predecessor_checks_and_sets_nothing() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedRunner::new();
        let api = ScriptedApiClient::new();
        let env = ws.env(&runner, &api);
        let mut state = ws.load_state();

        let report = run_pipeline(&env, &mut state, &[FIRST, SECOND], true).expect("dry run");
        assert_eq!(report.count(GuardOutcome::DryRun), 2);
        assert!(ws.load_state().get("test").is_none());
    }
}
