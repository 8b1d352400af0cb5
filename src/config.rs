//! Engine configuration
//!
//! Environment-driven settings for the engine selector, leases and case
//! deadlines. `from_env` validates every variable and names the offending
//! one on failure.

use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::types::{parse_iso8601_duration, PreferredEngine};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default variant when a specification declares no profile
    pub engine_default: PreferredEngine,
    /// Whether the stateless runtime is available at all
    pub stateless_enabled: bool,
    /// Longest case duration the stateless runtime should host
    pub stateless_max_duration: Option<chrono::Duration>,
    /// Whether `engine-admin` callers may override the selector
    pub override_allowed: bool,
    /// Default work-item lease TTL in milliseconds
    pub lease_default_ttl_ms: u64,
    /// Default maximum delivery attempts per work item
    pub max_attempts: u32,
    /// Case hard deadline in milliseconds; `None` means unlimited
    pub case_deadline_default_ms: Option<u64>,
    /// Specification cache capacity
    pub spec_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_default: PreferredEngine::Stateful,
            stateless_enabled: true,
            stateless_max_duration: None,
            override_allowed: true,
            lease_default_ttl_ms: 30_000,
            max_attempts: 3,
            case_deadline_default_ms: None,
            spec_cache_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Build from the process environment
    pub fn from_env() -> WorkflowResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("ENGINE_DEFAULT") {
            config.engine_default = match value.to_ascii_lowercase().as_str() {
                "stateful" => PreferredEngine::Stateful,
                "stateless" => PreferredEngine::Stateless,
                _ => {
                    return Err(WorkflowError::Configuration {
                        variable: "ENGINE_DEFAULT",
                        message: format!("expected stateful or stateless, got {value}"),
                    })
                }
            };
        }
        if let Ok(value) = std::env::var("STATELESS_ENABLED") {
            config.stateless_enabled = parse_bool("STATELESS_ENABLED", &value)?;
        }
        if let Ok(value) = std::env::var("STATELESS_MAX_DURATION_HINT") {
            config.stateless_max_duration = Some(parse_iso8601_duration(&value).ok_or(
                WorkflowError::Configuration {
                    variable: "STATELESS_MAX_DURATION_HINT",
                    message: format!("not an ISO-8601 duration: {value}"),
                },
            )?);
        }
        if let Ok(value) = std::env::var("OVERRIDE_ALLOWED") {
            config.override_allowed = parse_bool("OVERRIDE_ALLOWED", &value)?;
        }
        if let Ok(value) = std::env::var("LEASE_DEFAULT_TTL_MS") {
            config.lease_default_ttl_ms =
                value.parse().map_err(|_| WorkflowError::Configuration {
                    variable: "LEASE_DEFAULT_TTL_MS",
                    message: format!("not a millisecond count: {value}"),
                })?;
        }
        if let Ok(value) = std::env::var("CASE_DEADLINE_DEFAULT_MS") {
            config.case_deadline_default_ms =
                Some(value.parse().map_err(|_| WorkflowError::Configuration {
                    variable: "CASE_DEADLINE_DEFAULT_MS",
                    message: format!("not a millisecond count: {value}"),
                })?);
        }
        if let Ok(value) = std::env::var("CASEWEAVE_SPEC_CACHE_CAPACITY") {
            config.spec_cache_capacity =
                value.parse().map_err(|_| WorkflowError::Configuration {
                    variable: "CASEWEAVE_SPEC_CACHE_CAPACITY",
                    message: format!("not a count: {value}"),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the assembled configuration
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.lease_default_ttl_ms == 0 {
            return Err(WorkflowError::Configuration {
                variable: "LEASE_DEFAULT_TTL_MS",
                message: "lease TTL must be positive".to_string(),
            });
        }
        if self.spec_cache_capacity == 0 {
            return Err(WorkflowError::Configuration {
                variable: "CASEWEAVE_SPEC_CACHE_CAPACITY",
                message: "cache capacity must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_bool(variable: &'static str, value: &str) -> WorkflowResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(WorkflowError::Configuration {
            variable,
            message: format!("expected true or false, got {value}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "ENGINE_DEFAULT",
            "STATELESS_ENABLED",
            "STATELESS_MAX_DURATION_HINT",
            "OVERRIDE_ALLOWED",
            "LEASE_DEFAULT_TTL_MS",
            "CASE_DEADLINE_DEFAULT_MS",
            "CASEWEAVE_SPEC_CACHE_CAPACITY",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.engine_default, PreferredEngine::Stateful);
        assert_eq!(config.lease_default_ttl_ms, 30_000);
        assert!(config.case_deadline_default_ms.is_none());
    }

    #[test]
    #[serial]
    fn environment_overrides() {
        clear_env();
        std::env::set_var("ENGINE_DEFAULT", "stateless");
        std::env::set_var("STATELESS_MAX_DURATION_HINT", "PT5M");
        std::env::set_var("LEASE_DEFAULT_TTL_MS", "1500");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.engine_default, PreferredEngine::Stateless);
        assert_eq!(
            config.stateless_max_duration,
            Some(chrono::Duration::seconds(300))
        );
        assert_eq!(config.lease_default_ttl_ms, 1500);
        clear_env();
    }

    #[test]
    #[serial]
    fn bad_values_name_the_variable() {
        clear_env();
        std::env::set_var("ENGINE_DEFAULT", "quantum");
        let err = EngineConfig::from_env().unwrap_err();
        match err {
            WorkflowError::Configuration { variable, .. } => {
                assert_eq!(variable, "ENGINE_DEFAULT")
            }
            other => panic!("unexpected error {other}"),
        }
        clear_env();
    }
}
