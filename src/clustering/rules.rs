//! Clusters failures by the user-authored rules they match.

use crate::model::{ClusterSet, Failure, RulesVersion};
use crate::rules::lang::Features;
use crate::rules::Ruleset;

pub const NAME: &str = "rules-v2";

fn features(failure: &Failure) -> Features<'_> {
    Features {
        test: &failure.test_id,
        reason: failure.primary_reason().unwrap_or(""),
    }
}

/// Ids of every active rule matching the failure.
pub fn cluster(ruleset: &Ruleset, failure: &Failure) -> Vec<String> {
    let features = features(failure);
    ruleset
        .active_rules()
        .iter()
        .filter(|rule| rule.matches(&features))
        .map(|rule| rule.rule_id.clone())
        .collect()
}

/// Rule matches for a failure whose previous matches were computed against
/// rules version `since`.
///
/// Previous matches survive if their rule is still active and unchanged;
/// only rules updated after `since` are evaluated.
pub fn cluster_incremental(
    ruleset: &Ruleset,
    since: RulesVersion,
    previous: &ClusterSet,
    failure: &Failure,
) -> Vec<String> {
    let mut ids: Vec<String> = previous
        .for_algorithm(NAME)
        .filter(|id| ruleset.is_unchanged_since(&id.id, since))
        .map(|id| id.id.clone())
        .collect();

    let features = features(failure);
    ids.extend(
        ruleset
            .active_rules_updated_since(since)
            .filter(|rule| rule.matches(&features))
            .map(|rule| rule.rule_id.clone()),
    );
    ids
}
