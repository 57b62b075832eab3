//! Environment variable validation for spawned job processes.
//!
//! Jobs may carry an `environment` map that is merged into the subprocess
//! environment. Only names that are well-formed, start with an allow-listed
//! prefix, and carry a bounded value survive. Rejections are logged and
//! dropped; validation never fails.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Longest accepted value, in bytes.
pub const MAX_ENV_VALUE_LEN: usize = 4096;

/// Prefixes a job-supplied variable name must start with.
pub const ALLOWED_ENV_PREFIXES: &[&str] = &[
    "DELPHI_",
    "AWS_",
    "ANTHROPIC_API_",
    "OPENAI_API_",
    "GEMINI_API_",
    "OLLAMA_",
];

static ENV_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name pattern is a valid regex")
});

/// Filters caller-supplied environment variables.
#[derive(Debug, Clone)]
pub struct EnvValidator {
    prefixes: Vec<String>,
    max_value_len: usize,
}

impl EnvValidator {
    pub fn new<I, S>(prefixes: I, max_value_len: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            max_value_len,
        }
    }

    /// Why `name=value` would be dropped, if it would be.
    fn rejection(&self, name: &str, value: &str) -> Option<&'static str> {
        if !ENV_NAME_RE.is_match(name) {
            return Some("malformed name");
        }
        if !self.prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            return Some("prefix not allowed");
        }
        if value.len() > self.max_value_len {
            return Some("value too long");
        }
        None
    }

    /// Keep only the entries that pass every check.
    pub fn validate(&self, vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        vars.iter()
            .filter(|(name, value)| match self.rejection(name, value) {
                Some(reason) => {
                    warn!(name = %name, reason, "Dropping job environment variable");
                    false
                }
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for EnvValidator {
    fn default() -> Self {
        Self::new(ALLOWED_ENV_PREFIXES.iter().copied(), MAX_ENV_VALUE_LEN)
    }
}

/// Validate with the default allow-list.
pub fn validate_environment_variables(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    EnvValidator::default().validate(vars)
}
