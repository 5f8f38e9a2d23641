//! Dotted state keys.
//!
//! Keys encode a step's position in a dotted namespace so the state file can be
//! inspected and edited by hand during manual recovery. Renaming a key orphans
//! the flag in every existing state file, so these are stable.

/// Base infrastructure applied.
pub const BASE_APPLIED: &str = "create.terraformapplied.base";
/// Soft-serve configured and gitops content pushed.
pub const SOFTSERVE_CONFIGURED: &str = "create.softserve.configure";
/// GitLab access tokens provisioned.
pub const GITLAB_TOKENS: &str = "create.gitlab.tokens";
/// GitLab infrastructure applied.
pub const GITLAB_APPLIED: &str = "create.terraformapplied.gitlab";
/// Bot public key registered with GitLab.
pub const GITLAB_KEY_UPLOADED: &str = "gitlab.keyuploaded";

/// KMS key id captured from base terraform output.
pub const VAULT_KMS_KEY_ID: &str = "vault.kmskeyid";
/// GitLab personal access token (generated locally, injected remotely).
pub const GITLAB_TOKEN: &str = "gitlab.token";
/// GitLab runner registration token (extracted from a cluster secret).
pub const GITLAB_RUNNER_TOKEN: &str = "gitlab.runnertoken";
/// Bot SSH public key.
pub const BOT_PUBLIC_KEY: &str = "botpublickey";

/// Split a dotted key into segments, rejecting malformed keys.
///
/// Segments must be non-empty and use `[A-Za-z0-9_-]` only.
pub fn split_key(key: &str) -> Result<Vec<&str>, String> {
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    let segments: Vec<&str> = key.split('.').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(format!("key '{key}' has an empty segment"));
        }
        if segment
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(format!(
                "key '{key}' must be dot-separated [A-Za-z0-9_-] segments"
            ));
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_dotted_key() {
        let segments = split_key(BASE_APPLIED).expect("split");
        assert_eq!(segments, vec!["create", "terraformapplied", "base"]);
    }

    #[test]
    fn single_segment_key_is_valid() {
        assert_eq!(split_key(BOT_PUBLIC_KEY).expect("split"), vec!["botpublickey"]);
    }

    #[test]
    fn rejects_empty_segments_and_bad_chars() {
        assert!(split_key("").is_err());
        assert!(split_key("create..base").is_err());
        assert!(split_key(".create").is_err());
        assert!(split_key("create.base ").is_err());
        assert!(split_key("create/base").is_err());
    }
}
