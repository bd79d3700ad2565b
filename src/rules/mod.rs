//! # Rules
//!
//! User-authored failure association rules and the immutable [`Ruleset`]
//! snapshots the rules clustering algorithm evaluates.

pub mod cache;
pub mod lang;

pub use cache::{MemoryRuleProvider, RuleProvider, RulesetCache};

use crate::model::RulesVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// A rule as stored by the rule provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub project: String,
    pub rule_id: String,
    /// Predicate in the language of [`lang`].
    pub predicate: String,
    pub is_active: bool,
    /// Last time the predicate or the active flag changed.
    pub predicate_last_updated: DateTime<Utc>,
}

/// An active rule with its predicate compiled.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub rule_id: String,
    pub predicate_text: String,
    pub predicate: lang::Expr,
    pub predicate_last_updated: DateTime<Utc>,
}

impl CachedRule {
    pub fn matches(&self, features: &lang::Features<'_>) -> bool {
        self.predicate.evaluate(features)
    }
}

/// Immutable snapshot of a project's active rules at one rules version.
#[derive(Debug, Clone)]
pub struct Ruleset {
    project: String,
    version: RulesVersion,
    /// Sorted by rule id.
    active_rules: Vec<CachedRule>,
    by_id: HashMap<String, usize>,
}

impl Ruleset {
    /// Ruleset of a project with no rules.
    pub fn empty(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            version: RulesVersion::starting_epoch(),
            active_rules: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Build a ruleset from every rule of a project, active or not.
    ///
    /// The version is the latest predicate update of any rule, so
    /// deactivating a rule advances it too. Rules whose predicate fails to
    /// compile are left out and never match.
    pub fn new(project: impl Into<String>, definitions: Vec<RuleDefinition>) -> Self {
        let project = project.into();
        let version = definitions
            .iter()
            .map(|rule| RulesVersion(rule.predicate_last_updated))
            .max()
            .unwrap_or_else(RulesVersion::starting_epoch)
            .max(RulesVersion::starting_epoch());

        let mut active_rules: Vec<CachedRule> = definitions
            .into_iter()
            .filter(|rule| rule.is_active)
            .filter_map(|rule| match lang::parse(&rule.predicate) {
                Ok(predicate) => Some(CachedRule {
                    rule_id: rule.rule_id,
                    predicate_text: rule.predicate,
                    predicate,
                    predicate_last_updated: rule.predicate_last_updated,
                }),
                Err(err) => {
                    warn!(
                        project = %project,
                        rule_id = %rule.rule_id,
                        "skipping rule with invalid predicate: {}",
                        err
                    );
                    None
                }
            })
            .collect();
        active_rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        active_rules.dedup_by(|a, b| a.rule_id == b.rule_id);

        let by_id = active_rules
            .iter()
            .enumerate()
            .map(|(index, rule)| (rule.rule_id.clone(), index))
            .collect();

        Self {
            project,
            version,
            active_rules,
            by_id,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn version(&self) -> RulesVersion {
        self.version
    }

    pub fn active_rules(&self) -> &[CachedRule] {
        &self.active_rules
    }

    pub fn rule(&self, rule_id: &str) -> Option<&CachedRule> {
        self.by_id.get(rule_id).map(|&index| &self.active_rules[index])
    }

    /// Active rules whose predicate changed strictly after `version`.
    pub fn active_rules_updated_since(&self, version: RulesVersion) -> impl Iterator<Item = &CachedRule> {
        self.active_rules
            .iter()
            .filter(move |rule| RulesVersion(rule.predicate_last_updated) > version)
    }

    /// True if the rule is active and its predicate has not changed since
    /// `version`, so a match computed at `version` is still valid.
    pub fn is_unchanged_since(&self, rule_id: &str, version: RulesVersion) -> bool {
        self.rule(rule_id)
            .map(|rule| RulesVersion(rule.predicate_last_updated) <= version)
            .unwrap_or(false)
    }
}
