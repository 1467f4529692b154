//! Category to decision mapping for a running session.

use classguard_integrations::SessionPolicyOverride;
use classguard_storage::{Category, Decision};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{ClassificationConfig, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};

/// Category to decision table. Categories without a rule are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    rules: HashMap<Category, Decision>,
}

impl PolicyTable {
    /// Build from `category = "allow" | "block"` pairs. Unknown names are
    /// skipped with a warning.
    #[must_use]
    pub fn from_rules<'a, I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut table = Self {
            rules: HashMap::new(),
        };
        table.merge(rules);
        table
    }

    fn merge<'a, I>(&mut self, rules: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (category, decision) in rules {
            match (category.parse::<Category>(), decision.parse::<Decision>()) {
                (Ok(category), Ok(decision)) => {
                    self.rules.insert(category, decision);
                }
                (Err(e), _) | (_, Err(e)) => log::warn!("Ignoring policy rule: {e}"),
            }
        }
    }

    #[must_use]
    pub fn decide(&self, category: Category) -> Decision {
        self.rules.get(&category).copied().unwrap_or(Decision::Allow)
    }
}

/// Everything the classification loop and the guard need from policy
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub interval: Duration,
    pub confidence_threshold: f32,
    pub table: PolicyTable,
    /// Lock from the first tick, whatever the classifier says
    pub always_on_lock: bool,
    pub relax_when_away: bool,
}

impl SessionPolicy {
    /// Local config, overlaid with whatever the `start` command carried
    #[must_use]
    pub fn resolve(config: &ClassificationConfig, remote: Option<&SessionPolicyOverride>) -> Self {
        let mut policy = Self {
            interval: config.interval(),
            confidence_threshold: config.confidence_threshold,
            table: PolicyTable::from_rules(&config.policy),
            always_on_lock: config.always_on_lock,
            relax_when_away: config.relax_when_away,
        };

        if let Some(remote) = remote {
            if let Some(secs) = remote.interval_secs {
                policy.interval =
                    Duration::from_secs(secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS));
            }
            if let Some(threshold) = remote.confidence_threshold {
                policy.confidence_threshold = threshold.clamp(0.0, 1.0);
            }
            if let Some(always_on_lock) = remote.always_on_lock {
                policy.always_on_lock = always_on_lock;
            }
            policy.table.merge(&remote.rules);
        }

        policy
    }
}
