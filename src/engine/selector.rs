//! Engine selection
//!
//! Routes each launch to the stateful or stateless variant from the
//! specification's execution profile, the engine configuration, and any
//! admin override. The decision and its reason are recorded on the case
//! and surfaced in every query.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::types::{PreferredEngine, Specification};

/// Why the selector chose a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    /// No execution profile declared; the configured default applies
    NoProfile,
    /// The profile prefers the stateful variant
    PreferredStateful,
    /// The profile prefers stateless and all checks passed
    PreferredStateless,
    /// A declared timer exceeds the stateless duration hint
    TimerExceedsHint,
    /// Stateless runtime unavailable; the profile allows falling back
    StatelessUnavailableFallback,
    /// An engine-admin override
    AdminOverride,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SelectionReason::NoProfile => "no-profile",
            SelectionReason::PreferredStateful => "preferred-stateful",
            SelectionReason::PreferredStateless => "preferred-stateless",
            SelectionReason::TimerExceedsHint => "timer-exceeds-hint",
            SelectionReason::StatelessUnavailableFallback => "stateless-unavailable-fallback",
            SelectionReason::AdminOverride => "admin-override",
        };
        write!(f, "{text}")
    }
}

/// The selector's decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineChoice {
    /// Chosen variant
    pub engine: PreferredEngine,
    /// Why
    pub reason: SelectionReason,
}

/// Requested override, honoured only for `engine-admin` callers
#[derive(Debug, Clone)]
pub struct EngineOverride {
    /// Variant the caller insists on
    pub engine: PreferredEngine,
    /// Caller role; must be `engine-admin`
    pub role: String,
}

/// Pick the engine variant for a launch
pub fn select(
    spec: &Specification,
    config: &EngineConfig,
    requested: Option<&EngineOverride>,
) -> WorkflowResult<EngineChoice> {
    if let Some(requested) = requested {
        if !config.override_allowed {
            return Err(WorkflowError::RoutingRejected(
                "engine overrides are disabled".to_string(),
            ));
        }
        if requested.role != "engine-admin" {
            return Err(WorkflowError::RoutingRejected(format!(
                "role {} may not override engine selection",
                requested.role
            )));
        }
        if requested.engine == PreferredEngine::Stateless {
            check_stateless_feasible(spec, config)?;
        }
        tracing::warn!(spec_id = %spec.id, engine = ?requested.engine, "engine selection overridden by admin");
        return Ok(EngineChoice {
            engine: requested.engine,
            reason: SelectionReason::AdminOverride,
        });
    }

    let Some(profile) = &spec.execution_profile else {
        return Ok(EngineChoice {
            engine: config.engine_default,
            reason: SelectionReason::NoProfile,
        });
    };

    match profile.preferred {
        PreferredEngine::Stateful => Ok(EngineChoice {
            engine: PreferredEngine::Stateful,
            reason: SelectionReason::PreferredStateful,
        }),
        PreferredEngine::Stateless => {
            if spec.has_human_tasks() && !profile.allow_human_tasks {
                return Err(WorkflowError::RoutingRejected(
                    "specification contains human tasks and the profile disallows them under stateless".to_string(),
                ));
            }
            if let (Some(longest), Some(hint)) =
                (spec.longest_timer(), config.stateless_max_duration)
            {
                if longest > hint {
                    return Ok(EngineChoice {
                        engine: PreferredEngine::Stateful,
                        reason: SelectionReason::TimerExceedsHint,
                    });
                }
            }
            if !config.stateless_enabled {
                if profile.fallback_to_stateful {
                    tracing::warn!(spec_id = %spec.id, "stateless runtime unavailable, falling back to stateful");
                    return Ok(EngineChoice {
                        engine: PreferredEngine::Stateful,
                        reason: SelectionReason::StatelessUnavailableFallback,
                    });
                }
                return Err(WorkflowError::ServiceUnavailable(
                    "stateless runtime is disabled and the profile forbids fallback".to_string(),
                ));
            }
            Ok(EngineChoice {
                engine: PreferredEngine::Stateless,
                reason: SelectionReason::PreferredStateless,
            })
        }
    }
}

/// An explicit stateless override must still be runnable
fn check_stateless_feasible(spec: &Specification, config: &EngineConfig) -> WorkflowResult<()> {
    if !config.stateless_enabled {
        return Err(WorkflowError::ServiceUnavailable(
            "stateless runtime is disabled".to_string(),
        ));
    }
    let allow_human = spec
        .execution_profile
        .as_ref()
        .is_some_and(|p| p.allow_human_tasks);
    if spec.has_human_tasks() && !allow_human {
        return Err(WorkflowError::RoutingRejected(
            "specification contains human tasks and may not run stateless".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::load;

    fn spec_with(profile: Option<serde_json::Value>, human: bool, timer: Option<&str>) -> Specification {
        let mut task = serde_json::json!({"id": "a", "human": human});
        if let Some(timer) = timer {
            task["timer"] = serde_json::json!(timer);
        }
        let mut doc = serde_json::json!({
            "id": {"id": "s", "version": "1"},
            "root_net": "main",
            "nets": {"main": {
                "name": "main",
                "input_condition": "start",
                "output_condition": "end",
                "tasks": {"a": task},
                "flows": [
                    {"source": "start", "target": "a"},
                    {"source": "a", "target": "end"}
                ]
            }}
        });
        if let Some(profile) = profile {
            doc["execution_profile"] = profile;
        }
        load(doc.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn no_profile_uses_configured_default() {
        let spec = spec_with(None, false, None);
        let choice = select(&spec, &EngineConfig::default(), None).unwrap();
        assert_eq!(choice.engine, PreferredEngine::Stateful);
        assert_eq!(choice.reason, SelectionReason::NoProfile);
    }

    #[test]
    fn stateless_preference_honoured() {
        let spec = spec_with(
            Some(serde_json::json!({"preferred": "stateless"})),
            false,
            None,
        );
        let choice = select(&spec, &EngineConfig::default(), None).unwrap();
        assert_eq!(choice.engine, PreferredEngine::Stateless);
    }

    #[test]
    fn human_tasks_reject_stateless() {
        let spec = spec_with(
            Some(serde_json::json!({"preferred": "stateless", "allow_human_tasks": false})),
            true,
            None,
        );
        let err = select(&spec, &EngineConfig::default(), None).unwrap_err();
        assert!(matches!(err, WorkflowError::RoutingRejected(_)));
    }

    #[test]
    fn long_timer_routes_to_stateful() {
        let spec = spec_with(
            Some(serde_json::json!({"preferred": "stateless"})),
            false,
            Some("P2D"),
        );
        let config = EngineConfig {
            stateless_max_duration: Some(chrono::Duration::hours(1)),
            ..EngineConfig::default()
        };
        let choice = select(&spec, &config, None).unwrap();
        assert_eq!(choice.engine, PreferredEngine::Stateful);
        assert_eq!(choice.reason, SelectionReason::TimerExceedsHint);
    }

    #[test]
    fn unavailable_stateless_falls_back_or_fails() {
        let config = EngineConfig {
            stateless_enabled: false,
            ..EngineConfig::default()
        };

        let spec = spec_with(
            Some(serde_json::json!({"preferred": "stateless", "fallback_to_stateful": true})),
            false,
            None,
        );
        let choice = select(&spec, &config, None).unwrap();
        assert_eq!(choice.engine, PreferredEngine::Stateful);
        assert_eq!(choice.reason, SelectionReason::StatelessUnavailableFallback);

        let spec = spec_with(
            Some(serde_json::json!({"preferred": "stateless", "fallback_to_stateful": false})),
            false,
            None,
        );
        let err = select(&spec, &config, None).unwrap_err();
        assert!(matches!(err, WorkflowError::ServiceUnavailable(_)));
    }

    #[test]
    fn override_requires_admin_role() {
        let spec = spec_with(None, false, None);
        let config = EngineConfig::default();

        let err = select(
            &spec,
            &config,
            Some(&EngineOverride {
                engine: PreferredEngine::Stateless,
                role: "operator".to_string(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::RoutingRejected(_)));

        let choice = select(
            &spec,
            &config,
            Some(&EngineOverride {
                engine: PreferredEngine::Stateless,
                role: "engine-admin".to_string(),
            }),
        )
        .unwrap();
        assert_eq!(choice.engine, PreferredEngine::Stateless);
        assert_eq!(choice.reason, SelectionReason::AdminOverride);
    }

    #[test]
    fn override_to_stateless_with_human_tasks_is_rejected() {
        let spec = spec_with(None, true, None);
        let err = select(
            &spec,
            &EngineConfig::default(),
            Some(&EngineOverride {
                engine: PreferredEngine::Stateless,
                role: "engine-admin".to_string(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::RoutingRejected(_)));
    }
}
