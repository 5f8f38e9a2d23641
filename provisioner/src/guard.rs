//! Step guard: idempotency, dry-run short-circuit and flag commit.
//!
//! A step body runs at most once per flag across any number of invocations, as
//! long as the flag was durably written. The flag is committed only after the
//! body returns successfully, so a failed or interrupted step is re-entered on
//! the next run.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::types::GuardOutcome;
use crate::io::run_state::RunState;

/// Run `body` under the guard for `flag_key`.
#[instrument(skip_all, fields(step = flag_key, dry_run))]
pub fn guard_step<F>(
    state: &mut RunState,
    flag_key: &str,
    dry_run: bool,
    body: F,
) -> Result<GuardOutcome>
where
    F: FnOnce(&mut RunState) -> Result<()>,
{
    if state.get_bool(flag_key) {
        info!("skipping {flag_key}: already completed");
        return Ok(GuardOutcome::Skipped);
    }
    if dry_run {
        info!("[dry-run] {flag_key} skipped");
        return Ok(GuardOutcome::DryRun);
    }

    info!("executing {flag_key}");
    if let Err(err) = body(state) {
        warn!(err = %format!("{err:#}"), "step failed, flag left unset");
        return Err(err);
    }
    state
        .commit(flag_key, Value::Bool(true))
        .with_context(|| format!("record completion of {flag_key}"))?;
    info!("completed {flag_key}");
    Ok(GuardOutcome::Completed)
}
