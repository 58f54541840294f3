//! Identity key resolution: maps a request's identity candidates and endpoint
//! class onto a bound `(identity key, policy)` pair.

use crate::error::{Error, Result};
use crate::rate_limit_config::{Policy, PolicyRegistry};
use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;

pub const UNKNOWN_IDENTITY: &str = "anon:unknown";

/// Identity information made available by upstream authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityCandidates {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl IdentityCandidates {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ip: None,
        }
    }

    pub fn ip(ip: impl Into<String>) -> Self {
        Self {
            user_id: None,
            ip: Some(ip.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    Ip,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::User => "user",
            IdentityKind::Ip => "ip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyResolver {
    policies: Arc<PolicyRegistry>,
}

impl KeyResolver {
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn resolve(
        &self,
        label: &str,
        identity: &IdentityCandidates,
    ) -> Result<(String, Arc<Policy>)> {
        let policy = self
            .policies
            .get(label)
            .ok_or_else(|| Error::UnknownPolicy(label.to_string()))?;
        let key = Self::identity_key(&policy, identity);
        Ok((key, policy))
    }

    /// Authenticated users win over IPs; requests with neither share one bucket.
    pub fn identity_key(policy: &Policy, identity: &IdentityCandidates) -> String {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(Self::sanitize)
        };

        let candidate = present(&identity.user_id)
            .map(|id| (IdentityKind::User, id))
            .or_else(|| present(&identity.ip).map(|ip| (IdentityKind::Ip, ip)));

        match candidate {
            Some((kind, id)) => policy.identity_template().render(kind.as_str(), &id),
            None => UNKNOWN_IDENTITY.to_string(),
        }
    }

    /// Percent-encode every byte outside `[A-Za-z0-9:.-_@]`, `%` included, so
    /// distinct ids never share a key.
    pub fn sanitize(raw: &str) -> String {
        let mut key = String::with_capacity(raw.len());
        for byte in raw.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b':' | b'.' | b'-' | b'_' | b'@') {
                key.push(char::from(byte));
            } else {
                let _ = write!(key, "%{byte:02X}");
            }
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit_config::PolicySpec;
    use std::time::Duration;

    fn resolver() -> KeyResolver {
        KeyResolver::new(Arc::new(PolicyRegistry::defaults()))
    }

    #[test]
    fn test_user_takes_precedence_over_ip() {
        let identity = IdentityCandidates {
            user_id: Some("42".into()),
            ip: Some("10.0.0.1".into()),
        };
        let (key, policy) = resolver().resolve("query", &identity).unwrap();
        assert_eq!(key, "user:42");
        assert_eq!(policy.label(), "query");
    }

    #[test]
    fn test_ip_when_anonymous() {
        let (key, _) = resolver()
            .resolve("query", &IdentityCandidates::ip("192.168.1.1"))
            .unwrap();
        assert_eq!(key, "ip:192.168.1.1");
    }

    #[test]
    fn test_ipv6_zone_is_encoded() {
        let (key, _) = resolver()
            .resolve("query", &IdentityCandidates::ip("2001:db8::1"))
            .unwrap();
        assert_eq!(key, "ip:2001:db8::1");

        let (key, _) = resolver()
            .resolve("query", &IdentityCandidates::ip("fe80::1%eth0"))
            .unwrap();
        assert_eq!(key, "ip:fe80::1%25eth0");
    }

    #[test]
    fn test_unknown_bucket() {
        let (key, _) = resolver()
            .resolve("auth", &IdentityCandidates::default())
            .unwrap();
        assert_eq!(key, UNKNOWN_IDENTITY);

        let blank = IdentityCandidates {
            user_id: Some("  ".into()),
            ip: None,
        };
        assert_eq!(resolver().resolve("auth", &blank).unwrap().0, UNKNOWN_IDENTITY);
    }

    #[test]
    fn test_user_and_ip_never_collide() {
        let (user_key, _) = resolver()
            .resolve("query", &IdentityCandidates::user("1.2.3.4"))
            .unwrap();
        let (ip_key, _) = resolver()
            .resolve("query", &IdentityCandidates::ip("1.2.3.4"))
            .unwrap();
        assert_ne!(user_key, ip_key);
    }

    #[test]
    fn test_unknown_label() {
        let err = resolver()
            .resolve("billing", &IdentityCandidates::user("1"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPolicy(label) if label == "billing"));
    }

    #[test]
    fn test_custom_template() {
        let policy = Policy::from_spec(
            PolicySpec::new("upload", Duration::from_secs(60), 3).identity_template("up/{kind}/{id}"),
        )
        .unwrap();
        assert_eq!(
            KeyResolver::identity_key(&policy, &IdentityCandidates::user("bob@example.com")),
            "up/user/bob@example.com"
        );
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(
            KeyResolver::sanitize("test#key with$chars"),
            "test%23key%20with%24chars"
        );
        assert_eq!(KeyResolver::sanitize("münchen"), "m%C3%BCnchen");
    }

    #[test]
    fn test_distinct_ids_keep_distinct_keys() {
        let keys: std::collections::HashSet<_> =
            ["alice smith", "alice_smith", "alice%20smith", "alice#smith"]
                .into_iter()
                .map(|id| {
                    resolver()
                        .resolve("query", &IdentityCandidates::user(id))
                        .unwrap()
                        .0
                })
                .collect();
        assert_eq!(keys.len(), 4);
        assert!(keys.contains("user:alice_smith"));
        assert!(keys.contains("user:alice%20smith"));
    }

    #[test]
    fn test_user_and_ip_stay_apart_under_custom_template() {
        let policy = Policy::from_spec(
            PolicySpec::new("tenant", Duration::from_secs(60), 3)
                .identity_template("tenant-a/{kind}/{id}"),
        )
        .unwrap();
        let user = KeyResolver::identity_key(&policy, &IdentityCandidates::user("10.0.0.1"));
        let ip = KeyResolver::identity_key(&policy, &IdentityCandidates::ip("10.0.0.1"));
        assert_eq!(user, "tenant-a/user/10.0.0.1");
        assert_eq!(ip, "tenant-a/ip/10.0.0.1");
        assert_ne!(user, ip);

        let kindless = PolicySpec::new("tenant", Duration::from_secs(60), 3)
            .identity_template("tenant-a/{id}");
        assert!(Policy::from_spec(kindless).is_err());
    }
}
