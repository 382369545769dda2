// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the Ingress API.

use crate::ExecuteRequest;

/// Maximum declared secret/argument name length, to keep prompts and logs
/// bounded.
const MAX_NAME_LENGTH: usize = 256;

/// Validate an inbound `POST /execute` payload, accumulating every error
/// found rather than failing on the first.
pub fn validate_execute_request(req: &ExecuteRequest) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if req.skill_id.trim().is_empty() {
        errors.push("skill_id must not be empty".to_string());
    }
    if req.skill_url.trim().is_empty() {
        errors.push("skill_url must not be empty".to_string());
    }

    for name in &req.secrets {
        if name.is_empty() {
            errors.push("secret names must not be empty".to_string());
        } else if name.len() > MAX_NAME_LENGTH {
            errors.push(format!("secret name `{name}` exceeds maximum length"));
        }
    }

    for key in req.args.keys() {
        if key.is_empty() {
            errors.push("argument names must not be empty".to_string());
        } else if key.len() > MAX_NAME_LENGTH {
            errors.push(format!("argument name `{key}` exceeds maximum length"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            skill_id: "hello".to_string(),
            skill_url: "data:text/plain,hi".to_string(),
            secrets: Vec::new(),
            args: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(validate_execute_request(&request()).is_ok());
    }

    #[test]
    fn empty_skill_id_is_rejected() {
        let mut req = request();
        req.skill_id = String::new();
        let errs = validate_execute_request(&req).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("skill_id")));
    }

    #[test]
    fn empty_skill_url_is_rejected() {
        let mut req = request();
        req.skill_url = "  ".to_string();
        let errs = validate_execute_request(&req).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("skill_url")));
    }

    #[test]
    fn empty_secret_name_is_rejected() {
        let mut req = request();
        req.secrets.push(String::new());
        let errs = validate_execute_request(&req).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("secret name")));
    }
}
