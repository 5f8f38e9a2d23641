//! Read-only status view and manual flag reset.

use anyhow::Result;
use tracing::info;

use crate::core::keys::{
    BOT_PUBLIC_KEY, GITLAB_RUNNER_TOKEN, GITLAB_TOKEN, VAULT_KMS_KEY_ID, split_key,
};
use crate::error::ProvisionError;
use crate::io::run_state::RunState;
use crate::steps::{PIPELINE, find_step};

/// Captured values reported by `status` (presence only, never the value).
const CAPTURED_KEYS: &[&str] = &[
    VAULT_KMS_KEY_ID,
    GITLAB_TOKEN,
    GITLAB_RUNNER_TOKEN,
    BOT_PUBLIC_KEY,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub key: &'static str,
    pub name: &'static str,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedStatus {
    pub key: &'static str,
    pub present: bool,
}

pub fn step_statuses(state: &RunState) -> Vec<StepStatus> {
    PIPELINE
        .iter()
        .map(|step| StepStatus {
            key: step.key,
            name: step.name,
            completed: state.get_bool(step.key),
        })
        .collect()
}

pub fn captured_statuses(state: &RunState) -> Vec<CapturedStatus> {
    CAPTURED_KEYS
        .iter()
        .copied()
        .map(|key| CapturedStatus {
            key,
            present: state.get_str(key).is_some(),
        })
        .collect()
}

/// What `reset` clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Every step flag; captured values stay.
    All,
    /// One key: a step flag or any key present in the state.
    Key(String),
}

/// Clear flags for manual recovery. Returns the keys actually removed.
pub fn reset_flags(state: &mut RunState, target: &ResetTarget) -> Result<Vec<String>> {
    match target {
        ResetTarget::All => {
            let mut removed = Vec::new();
            for step in PIPELINE {
                if let Some(previous) = state.remove(step.key)? {
                    removed.push((step.key, previous));
                }
            }
            if !removed.is_empty() {
                if let Err(err) = state.flush() {
                    // Keep memory in line with the unchanged file.
                    for (key, previous) in removed {
                        state.set(key, previous)?;
                    }
                    return Err(err.context("write run state"));
                }
            }
            info!(count = removed.len(), "reset step flags");
            Ok(removed.into_iter().map(|(key, _)| key.to_string()).collect())
        }
        ResetTarget::Key(key) => {
            split_key(key).map_err(ProvisionError::Prerequisite)?;
            if find_step(key).is_none() && state.get(key).is_none() {
                return Err(ProvisionError::Prerequisite(format!(
                    "{key} is neither a step flag nor present in the run state"
                ))
                .into());
            }
            let removed = state.commit_remove(key)?;
            info!(key = %key, removed, "reset key");
            Ok(if removed { vec![key.clone()] } else { Vec::new() })
        }
    }
}
