//! Shared deterministic types for guard and pipeline reporting.

/// What the step guard did with a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Flag already set; the step body was not invoked.
    Skipped,
    /// Dry-run; the step body was not invoked and the flag was not set.
    DryRun,
    /// The step body ran and its flag was durably committed.
    Completed,
}

impl GuardOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardOutcome::Skipped => "skipped",
            GuardOutcome::DryRun => "dry-run",
            GuardOutcome::Completed => "completed",
        }
    }
}

/// Outcome for a single step in a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub key: &'static str,
    pub name: &'static str,
    pub outcome: GuardOutcome,
}
