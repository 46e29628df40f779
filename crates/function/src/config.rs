//! Runtime configuration, read from the environment.

use std::time::Duration;

pub const ENV_TTL_SECS: &str = "PROTECTION_FN_TTL_SECS";
pub const ENV_REQUIRE_ENABLED: &str = "PROTECTION_FN_REQUIRE_ENABLED";

const DEFAULT_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionConfig {
    /// How long the orchestrator may cache a response.
    pub response_ttl: Duration,
    /// Only protect anything when the composite carries the `enabled` label.
    pub require_enabled_label: bool,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self { response_ttl: Duration::from_secs(DEFAULT_TTL_SECS), require_enabled_label: false }
    }
}

impl FunctionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = lookup(ENV_TTL_SECS).and_then(|s| s.trim().parse::<u64>().ok()) {
            cfg.response_ttl = Duration::from_secs(secs);
        }
        cfg.require_enabled_label = lookup(ENV_REQUIRE_ENABLED)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        cfg
    }
}
