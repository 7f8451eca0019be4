//! Instrumentation activation.
//!
//! The interception mechanism is external. The agent hands it the configured
//! matching rules once at startup and records whether it supports
//! re-instrumenting already loaded code.

pub mod plugin;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ActivationError;

pub use plugin::{AdapterContext, AdapterFactory, InstrumentationAdapter, PluginRegistry};

/// Selects a code path whose executions become units of `unit_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchingRule {
    pub unit_type: String,
    pub class_name: String,
    pub method_name: String,
}

impl MatchingRule {
    /// `class.method` identifier of the intercepted code path.
    pub fn target(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

/// What to do when two rules claim the same code path for different unit types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Abort activation.
    #[default]
    Fail,
    /// Keep the first rule, log the rest.
    FirstWins,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub retransform_supported: bool,
    pub active_rules: Vec<MatchingRule>,
}

/// The external interception capability.
pub trait InstrumentationActivator: Send + Sync {
    fn activate(
        &self,
        rules: &[MatchingRule],
        on_conflict: ConflictPolicy,
    ) -> Result<Activation, ActivationError>;
}

/// Activator for statically linked instrumentation: call sites are compiled
/// in and only the rule set needs resolving.
#[derive(Debug, Clone, Copy)]
pub struct StaticActivator {
    retransform_supported: bool,
}

impl StaticActivator {
    pub fn new(retransform_supported: bool) -> Self {
        Self {
            retransform_supported,
        }
    }
}

impl Default for StaticActivator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl InstrumentationActivator for StaticActivator {
    fn activate(
        &self,
        rules: &[MatchingRule],
        on_conflict: ConflictPolicy,
    ) -> Result<Activation, ActivationError> {
        Ok(Activation {
            retransform_supported: self.retransform_supported,
            active_rules: resolve_rules(rules, on_conflict)?,
        })
    }
}

/// Activator for hosts without an interception capability.
#[derive(Debug, Clone)]
pub struct UnavailableActivator {
    reason: String,
}

impl UnavailableActivator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl InstrumentationActivator for UnavailableActivator {
    fn activate(
        &self,
        _rules: &[MatchingRule],
        _on_conflict: ConflictPolicy,
    ) -> Result<Activation, ActivationError> {
        Err(ActivationError::Unavailable(self.reason.clone()))
    }
}

/// Removes exact duplicates and applies `on_conflict` to rules that map the
/// same code path to different unit types. Order of first appearance is kept.
pub fn resolve_rules(
    rules: &[MatchingRule],
    on_conflict: ConflictPolicy,
) -> Result<Vec<MatchingRule>, ActivationError> {
    let mut by_target: HashMap<String, &MatchingRule> = HashMap::new();
    let mut resolved = Vec::with_capacity(rules.len());

    for rule in rules {
        let target = rule.target();
        match by_target.get(&target) {
            None => {
                by_target.insert(target, rule);
                resolved.push(rule.clone());
            }
            Some(first) if first.unit_type == rule.unit_type => {}
            Some(first) => match on_conflict {
                ConflictPolicy::Fail => {
                    return Err(ActivationError::Conflict {
                        target,
                        first: first.unit_type.clone(),
                        second: rule.unit_type.clone(),
                    });
                }
                ConflictPolicy::FirstWins => {
                    warn!(
                        target = %target,
                        kept = %first.unit_type,
                        ignored = %rule.unit_type,
                        "conflicting instrumentation rule ignored",
                    );
                }
            },
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(unit_type: &str, class: &str, method: &str) -> MatchingRule {
        MatchingRule {
            unit_type: unit_type.to_string(),
            class_name: class.to_string(),
            method_name: method.to_string(),
        }
    }

    #[test]
    fn test_static_activator_reports_retransform_flag() {
        let rules = vec![rule("Background", "org.quartz.Job", "execute")];
        let activation = StaticActivator::new(true)
            .activate(&rules, ConflictPolicy::Fail)
            .expect("activate");
        assert!(activation.retransform_supported);
        assert_eq!(activation.active_rules, rules);
    }

    #[test]
    fn test_conflict_fails_activation() {
        let rules = vec![
            rule("Background", "org.quartz.Job", "execute"),
            rule("Web", "org.quartz.Job", "execute"),
        ];
        let err = StaticActivator::default()
            .activate(&rules, ConflictPolicy::Fail)
            .unwrap_err();
        assert!(matches!(
            err,
            ActivationError::Conflict { ref target, .. } if target == "org.quartz.Job.execute"
        ));
    }

    #[test]
    fn test_conflict_first_wins() {
        let rules = vec![
            rule("Background", "org.quartz.Job", "execute"),
            rule("Web", "org.quartz.Job", "execute"),
            rule("Web", "javax.servlet.Servlet", "service"),
        ];
        let resolved = resolve_rules(&rules, ConflictPolicy::FirstWins).expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].unit_type, "Background");
    }

    #[test]
    fn test_exact_duplicates_collapsed() {
        let rules = vec![
            rule("Background", "org.quartz.Job", "execute"),
            rule("Background", "org.quartz.Job", "execute"),
        ];
        assert_eq!(resolve_rules(&rules, ConflictPolicy::Fail).expect("resolve").len(), 1);
    }

    #[test]
    fn test_unavailable_activator() {
        let err = UnavailableActivator::new("no agent attach")
            .activate(&[], ConflictPolicy::Fail)
            .unwrap_err();
        assert!(err.to_string().contains("no agent attach"));
    }
}
