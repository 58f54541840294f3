use crate::error::{Error, Result};
use crate::key_generator::IdentityCandidates;

const MAX_LABEL_LEN: usize = 64;
const MAX_IDENTITY_LEN: usize = 256;

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Policy labels as they appear in request paths.
    pub fn validate_label(label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(Error::Validation("Policy label cannot be empty".to_string()));
        }

        if label.len() > MAX_LABEL_LEN {
            return Err(Error::Validation(format!(
                "Policy label exceeds {MAX_LABEL_LEN} characters"
            )));
        }

        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::Validation(
                "Policy label can only contain lowercase letters, digits, hyphens, and underscores"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Rendered identity keys, e.g. `user:42` or `ip:10.0.0.1`.
    pub fn validate_identity_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::InvalidIdentity);
        }

        if key.len() > MAX_IDENTITY_LEN {
            return Err(Error::Validation(format!(
                "Identity key exceeds {MAX_IDENTITY_LEN} characters"
            )));
        }

        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Validation(
                "Identity key cannot contain whitespace or control characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Bound candidate sizes before they reach the key resolver.
    pub fn validate_identity(identity: &IdentityCandidates) -> Result<()> {
        for (field, value) in [("userId", &identity.user_id), ("ip", &identity.ip)] {
            if value.as_ref().is_some_and(|v| v.len() > MAX_IDENTITY_LEN) {
                return Err(Error::Validation(format!(
                    "'{field}' exceeds {MAX_IDENTITY_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}
