//! Pure helpers for turning captured command output into secret values.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Remove quoting artifacts left by `-o jsonpath='...'` and surrounding whitespace.
pub fn strip_quoting(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != '\'' && *c != '"')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Decode a base64 secret value as captured from a cluster secret.
///
/// Fails on invalid base64, non-UTF-8 payloads and empty results; a garbled
/// token must never reach persisted state.
pub fn decode_base64_secret(raw: &str) -> Result<String, String> {
    let cleaned = strip_quoting(raw);
    if cleaned.is_empty() {
        return Err("encoded value is empty".to_string());
    }
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|err| format!("invalid base64: {err}"))?;
    let decoded = String::from_utf8(bytes).map_err(|_| "decoded value is not utf-8".to_string())?;
    if decoded.trim().is_empty() {
        return Err("decoded value is empty".to_string());
    }
    Ok(decoded)
}

/// Truncate a generated identifier to a fixed token length.
pub fn truncate_token(source: &str, len: usize) -> Result<String, String> {
    if len == 0 {
        return Err("token length must be > 0".to_string());
    }
    if source.chars().count() < len {
        return Err(format!(
            "source of {} chars is shorter than token length {len}",
            source.chars().count()
        ));
    }
    Ok(source.chars().take(len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_jsonpath_quotes() {
        assert_eq!(strip_quoting("'gitlab-toolbox-5d9c'\n"), "gitlab-toolbox-5d9c");
        assert_eq!(strip_quoting("  \"abc\"  "), "abc");
        assert_eq!(strip_quoting("''"), "");
    }

    #[test]
    fn decodes_quoted_base64() {
        // "runner-reg-token"
        let decoded = decode_base64_secret("'cnVubmVyLXJlZy10b2tlbg=='").expect("decode");
        assert_eq!(decoded, "runner-reg-token");
    }

    #[test]
    fn rejects_invalid_base64() {
        let err = decode_base64_secret("'not*base64!'").unwrap_err();
        assert!(err.contains("invalid base64"));
    }

    #[test]
    fn rejects_empty_and_non_utf8_payloads() {
        assert!(decode_base64_secret("''").is_err());
        // 0xff 0xfe
        let err = decode_base64_secret("//4=").unwrap_err();
        assert!(err.contains("utf-8"));
    }

    #[test]
    fn truncates_to_fixed_length() {
        let token = truncate_token("0f8fad5b-d9cb-469f-a165-70867728950e", 20).expect("token");
        assert_eq!(token, "0f8fad5b-d9cb-469f-a");
        assert!(truncate_token("short", 20).is_err());
        assert!(truncate_token("abc", 0).is_err());
    }
}
