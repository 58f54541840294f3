use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use validator::Validate;

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("label regex compiles"));

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder regex compiles"));

pub const DEFAULT_IDENTITY_TEMPLATE: &str = "{kind}:{id}";

/// Which calls consume quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CountingMode {
    #[default]
    #[serde(alias = "countAll")]
    All,
    #[serde(alias = "countFailures")]
    FailuresOnly,
    #[serde(alias = "countSuccesses")]
    SuccessesOnly,
}

/// Result of the protected operation, reported after it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failure,
}

impl CountingMode {
    /// Conditional modes count after the outcome is known instead of at check time.
    pub fn is_conditional(self) -> bool {
        !matches!(self, CountingMode::All)
    }

    pub fn counts(self, outcome: Outcome) -> bool {
        match self {
            CountingMode::All => false,
            CountingMode::FailuresOnly => outcome == Outcome::Failure,
            CountingMode::SuccessesOnly => outcome == Outcome::Success,
        }
    }
}

/// What to do when the shared store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DegradedMode {
    /// Keep enforcing with per-process counts.
    #[default]
    Local,
    /// Reject until the shared store is back.
    Deny,
}

/// Policy registration record as supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[validate(length(min = 1, max = 64), regex(path = *LABEL_RE))]
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,

    /// Human-readable alternative to `windowMs`, e.g. `"15m"`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub window: Option<Duration>,

    #[validate(range(min = 1))]
    pub quota: u64,

    #[serde(default)]
    pub counting_mode: CountingMode,

    #[serde(default = "default_identity_template")]
    pub identity_template: String,

    #[serde(default)]
    pub degraded: DegradedMode,
}

fn default_identity_template() -> String {
    DEFAULT_IDENTITY_TEMPLATE.to_string()
}

impl PolicySpec {
    pub fn new(label: &str, window: Duration, quota: u64) -> Self {
        Self {
            label: label.to_string(),
            window_ms: None,
            window: Some(window),
            quota,
            counting_mode: CountingMode::All,
            identity_template: default_identity_template(),
            degraded: DegradedMode::Local,
        }
    }

    pub fn counting(mut self, mode: CountingMode) -> Self {
        self.counting_mode = mode;
        self
    }

    pub fn degraded(mut self, mode: DegradedMode) -> Self {
        self.degraded = mode;
        self
    }

    pub fn identity_template(mut self, template: &str) -> Self {
        self.identity_template = template.to_string();
        self
    }

    fn resolved_window(&self) -> Result<Duration, String> {
        match (self.window_ms, self.window) {
            (Some(_), Some(_)) => Err("set either windowMs or window, not both".into()),
            (None, None) => Err("missing window length".into()),
            (Some(ms), None) => Ok(Duration::from_millis(ms)),
            (None, Some(window)) => Ok(window),
        }
    }
}

/// Renders identity keys from `{kind}` and `{id}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTemplate(String);

impl IdentityTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let (mut has_kind, mut has_id) = (false, false);
        for capture in PLACEHOLDER_RE.captures_iter(template) {
            match &capture[1] {
                "id" => has_id = true,
                "kind" => has_kind = true,
                other => return Err(invalid(&format!("unknown placeholder '{{{other}}}'"))),
            }
        }
        if !has_id {
            return Err(invalid("template must contain {id}"));
        }
        // Without the kind a user and an IP with the same text share a counter.
        if !has_kind {
            return Err(invalid("template must contain {kind}"));
        }

        let stripped = PLACEHOLDER_RE.replace_all(template, "");
        if stripped.contains('{') || stripped.contains('}') {
            return Err(invalid("unbalanced braces"));
        }

        Ok(Self(template.to_string()))
    }

    pub fn render(&self, kind: &str, id: &str) -> String {
        self.0.replace("{kind}", kind).replace("{id}", id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated, immutable rate limit policy for one endpoint class.
#[derive(Debug, Clone)]
pub struct Policy {
    label: String,
    window: Duration,
    quota: u64,
    counting_mode: CountingMode,
    identity_template: IdentityTemplate,
    degraded: DegradedMode,
}

impl Policy {
    pub fn from_spec(spec: PolicySpec) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPolicy {
            label: spec.label.clone(),
            reason,
        };

        spec.validate().map_err(|e| invalid(e.to_string()))?;
        let window = spec.resolved_window().map_err(invalid)?;
        if window.is_zero() {
            return Err(invalid("window must be greater than 0".into()));
        }
        let identity_template = IdentityTemplate::parse(&spec.identity_template)?;

        Ok(Self {
            label: spec.label,
            window,
            quota: spec.quota,
            counting_mode: spec.counting_mode,
            identity_template,
            degraded: spec.degraded,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn counting_mode(&self) -> CountingMode {
        self.counting_mode
    }

    pub fn identity_template(&self) -> &IdentityTemplate {
        &self.identity_template
    }

    pub fn degraded(&self) -> DegradedMode {
        self.degraded
    }
}

/// Policies by label, fixed after startup.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in endpoint classes.
    pub fn defaults() -> Self {
        let specs = vec![
            PolicySpec::new("auth", Duration::from_secs(15 * 60), 5)
                .counting(CountingMode::FailuresOnly),
            PolicySpec::new("mutation", Duration::from_secs(60), 30),
            PolicySpec::new("query", Duration::from_secs(15 * 60), 100),
            PolicySpec::new("admin", Duration::from_secs(5 * 60), 50),
        ];
        // The built-in specs are constants; a failure here is a bug.
        Self::from_specs(specs).expect("built-in policies are valid")
    }

    pub fn from_specs(specs: Vec<PolicySpec>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(Policy::from_spec(spec)?)?;
        }
        Ok(registry)
    }

    /// Load a JSON array of policy specs.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::PolicyFile(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let specs: Vec<PolicySpec> =
            serde_json::from_str(raw).map_err(|e| ConfigError::PolicyFile(e.to_string()))?;
        if specs.is_empty() {
            return Err(ConfigError::PolicyFile("no policies defined".into()));
        }
        Self::from_specs(specs)
    }

    pub fn register(&mut self, policy: Policy) -> Result<(), ConfigError> {
        if self.policies.contains_key(policy.label()) {
            return Err(ConfigError::DuplicatePolicy(policy.label().to_string()));
        }
        self.policies
            .insert(policy.label().to_string(), Arc::new(policy));
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<Arc<Policy>> {
        self.policies.get(label).cloned()
    }

    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
