//! Parser for the skill metadata header carried in each skill's code bytes.
//!
//! The header is a leading comment block containing lines of the form
//! `@<key> <value>`. Recognized keys: `skill` (required), `description`,
//! `secrets` (repeatable), `network` (repeatable), `timeout`.

use crate::error::{BrokerError, ErrorCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parsed contents of a skill's metadata header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SkillMetadata {
    /// Logical skill name (`@skill`). Required.
    pub skill: String,
    /// Human-readable description (`@description`), if present.
    pub description: Option<String>,
    /// Declared secret names (`@secrets`, one per line), in header order.
    pub secrets: Vec<String>,
    /// Declared network allow-list (`@network`, one hostname per line).
    pub network: Vec<String>,
    /// Wall-clock timeout in seconds (`@timeout`); defaults to
    /// [`crate::DEFAULT_TIMEOUT_SECS`] when absent.
    pub timeout_secs: u32,
}

/// Parse the leading comment block of `code` for `@key value` lines.
///
/// Recognizes `//`, `#`, and `--` comment prefixes so the header reads
/// naturally in whatever language the skill happens to be written in.
/// Parsing stops at the first line that isn't a recognized comment prefix.
///
/// # Errors
///
/// Returns [`ErrorCode::BadMetadata`] if no `@skill` line is found.
pub fn parse(code: &[u8]) -> Result<SkillMetadata, BrokerError> {
    let text = String::from_utf8_lossy(code);

    let mut skill: Option<String> = None;
    let mut description: Option<String> = None;
    let mut secrets = Vec::new();
    let mut network = Vec::new();
    let mut timeout_secs = crate::DEFAULT_TIMEOUT_SECS;

    for line in text.lines() {
        let Some(stripped) = strip_comment_prefix(line) else {
            break;
        };
        let stripped = stripped.trim();
        let Some(rest) = stripped.strip_prefix('@') else {
            continue;
        };
        let Some((key, value)) = rest.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim();
        match key {
            "skill" => skill = Some(value.to_string()),
            "description" => description = Some(value.to_string()),
            "secrets" => secrets.push(value.to_string()),
            "network" => network.push(value.to_string()),
            "timeout" => {
                if let Ok(n) = value.parse::<u32>() {
                    timeout_secs = n;
                }
            }
            _ => {}
        }
    }

    let skill = skill.ok_or_else(|| {
        BrokerError::new(
            ErrorCode::BadMetadata,
            "missing required @skill field in metadata header",
        )
    })?;

    Ok(SkillMetadata {
        skill,
        description,
        secrets,
        network,
        timeout_secs,
    })
}

fn strip_comment_prefix(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    trimmed
        .strip_prefix("//")
        .or_else(|| trimmed.strip_prefix("--"))
        .or_else(|| trimmed.strip_prefix('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_header() {
        let code = b"// @skill hello\n// @description says hi\n// @secrets K\n// @network api.example.com\n// @timeout 5\nprintln!(\"HELLO\");\n";
        let meta = parse(code).unwrap();
        assert_eq!(meta.skill, "hello");
        assert_eq!(meta.description.as_deref(), Some("says hi"));
        assert_eq!(meta.secrets, vec!["K".to_string()]);
        assert_eq!(meta.network, vec!["api.example.com".to_string()]);
        assert_eq!(meta.timeout_secs, 5);
    }

    #[test]
    fn missing_skill_is_bad_metadata() {
        let code = b"// @description no skill name here\nprintln!(\"HI\");\n";
        let err = parse(code).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadMetadata);
    }

    #[test]
    fn defaults_timeout_when_absent() {
        let code = b"# @skill minimal\nputs 'hi'\n";
        let meta = parse(code).unwrap();
        assert_eq!(meta.timeout_secs, crate::DEFAULT_TIMEOUT_SECS);
        assert!(meta.secrets.is_empty());
        assert!(meta.network.is_empty());
    }

    #[test]
    fn repeated_keys_accumulate_in_order() {
        let code = b"// @skill multi\n// @secrets A\n// @secrets B\n// @network one.test\n// @network two.test\ncode();\n";
        let meta = parse(code).unwrap();
        assert_eq!(meta.secrets, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            meta.network,
            vec!["one.test".to_string(), "two.test".to_string()]
        );
    }
}
