//! Per-project cache of [`Ruleset`] snapshots.

use super::{RuleDefinition, Ruleset};
use crate::config::RulesConfig;
use crate::model::RulesVersion;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of truth for a project's rules.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    /// Every rule of the project, including inactive ones.
    async fn read_rules(&self, project: &str) -> Result<Vec<RuleDefinition>>;
}

/// Rule provider backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryRuleProvider {
    rules: RwLock<FxHashMap<String, Vec<RuleDefinition>>>,
}

impl MemoryRuleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule, keyed by `(project, rule_id)`.
    pub fn upsert(&self, rule: RuleDefinition) {
        let mut rules = self.rules.write();
        let project_rules = rules.entry(rule.project.clone()).or_default();
        match project_rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(existing) => *existing = rule,
            None => project_rules.push(rule),
        }
    }
}

#[async_trait]
impl RuleProvider for MemoryRuleProvider {
    async fn read_rules(&self, project: &str) -> Result<Vec<RuleDefinition>> {
        Ok(self.rules.read().get(project).cloned().unwrap_or_default())
    }
}

#[derive(Clone)]
struct CacheEntry {
    ruleset: Arc<Ruleset>,
    fetched_at: Instant,
}

/// Caches the latest ruleset per project, refreshing entries older than the
/// refresh interval or older than a caller's minimum version.
pub struct RulesetCache {
    provider: Arc<dyn RuleProvider>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    refresh_interval: Duration,
}

impl RulesetCache {
    pub fn new(provider: Arc<dyn RuleProvider>, capacity: usize, refresh_interval: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            entries: Mutex::new(LruCache::new(capacity)),
            refresh_interval,
        }
    }

    pub fn from_config(provider: Arc<dyn RuleProvider>, config: &RulesConfig) -> Self {
        Self::new(
            provider,
            config.cache_capacity,
            Duration::from_secs(config.refresh_interval_secs),
        )
    }

    /// The project's ruleset, at least as new as `minimum` if given.
    ///
    /// Fails if the provider cannot yet serve a ruleset at `minimum`.
    pub async fn ruleset(&self, project: &str, minimum: Option<RulesVersion>) -> Result<Arc<Ruleset>> {
        let cached = self.entries.lock().get(project).cloned();
        if let Some(entry) = &cached {
            let fresh = entry.fetched_at.elapsed() < self.refresh_interval;
            let recent_enough = minimum.map_or(true, |min| entry.ruleset.version() >= min);
            // An explicit minimum that the cached copy already meets is
            // served without a refresh.
            if recent_enough && (fresh || minimum.is_some()) {
                return Ok(Arc::clone(&entry.ruleset));
            }
        }

        let definitions = self.provider.read_rules(project).await?;
        let fetched = Ruleset::new(project, definitions);
        if let Some(min) = minimum {
            if fetched.version() < min {
                return Err(anyhow!(
                    "rules version {} of project {} not yet visible (have {})",
                    min,
                    project,
                    fetched.version()
                ));
            }
        }

        let ruleset = match cached {
            Some(entry) if entry.ruleset.version() == fetched.version() => entry.ruleset,
            _ => {
                debug!(project, version = %fetched.version(), "loaded new ruleset");
                Arc::new(fetched)
            }
        };
        self.entries.lock().put(
            project.to_string(),
            CacheEntry {
                ruleset: Arc::clone(&ruleset),
                fetched_at: Instant::now(),
            },
        );
        Ok(ruleset)
    }
}
