//! Structural checks for the fixed step order.

use std::collections::BTreeSet;

use super::keys::split_key;

/// Minimal view of a step for ordering checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry<'a> {
    pub key: &'a str,
    pub requires: &'a [&'a str],
}

/// Validate a step order, returning every violation found.
///
/// Keys must be well formed and unique, and each required predecessor must
/// appear earlier in the order.
pub fn validate_order(entries: &[PlanEntry<'_>]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    for entry in entries {
        if let Err(err) = split_key(entry.key) {
            errors.push(err);
        }
        for required in entry.requires {
            if *required == entry.key {
                errors.push(format!("step {} requires itself", entry.key));
            } else if !seen.contains(required) {
                errors.push(format!(
                    "step {} requires {} which does not run before it",
                    entry.key, required
                ));
            }
        }
        if !seen.insert(entry.key) {
            errors.push(format!("duplicate step key {}", entry.key));
        }
    }
    errors
}
