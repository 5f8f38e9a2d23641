//! The provisioning pipeline, in execution order.

pub mod gitlab;
pub mod infra;
pub mod softserve;

use crate::core::keys::{
    BASE_APPLIED, GITLAB_APPLIED, GITLAB_KEY_UPLOADED, GITLAB_TOKENS, SOFTSERVE_CONFIGURED,
};
use crate::pipeline::StepDescriptor;

/// Fixed step order. Reordering is a code change; predecessors listed in
/// `requires` must come earlier.
pub const PIPELINE: &[StepDescriptor] = &[
    StepDescriptor {
        key: BASE_APPLIED,
        name: "apply base terraform",
        requires: &[],
        run: infra::apply_base,
    },
    StepDescriptor {
        key: SOFTSERVE_CONFIGURED,
        name: "configure soft-serve and push gitops",
        requires: &[BASE_APPLIED],
        run: softserve::configure_and_push,
    },
    StepDescriptor {
        key: GITLAB_TOKENS,
        name: "provision gitlab tokens",
        requires: &[SOFTSERVE_CONFIGURED],
        run: gitlab::provision_tokens,
    },
    StepDescriptor {
        key: GITLAB_APPLIED,
        name: "apply gitlab terraform",
        requires: &[GITLAB_TOKENS],
        run: infra::apply_gitlab,
    },
    StepDescriptor {
        key: GITLAB_KEY_UPLOADED,
        name: "upload bot public key",
        requires: &[GITLAB_TOKENS],
        run: gitlab::upload_key,
    },
];

/// Look up a step by its flag key.
pub fn find_step(key: &str) -> Option<&'static StepDescriptor> {
    PIPELINE.iter().find(|step| step.key == key)
}
