// Path: crates/schedule/src/placement/manager.rs
//! Rule storage, ordering, and the effective-rule computation.

use std::sync::Arc;

use meridian_cluster::RegionInfo;
use meridian_store::CoordKv;
use meridian_types::config::ReplicationConfig;
use meridian_types::{codec, keys, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::placement::rule::{default_rule, Rule};

/// Owns the rule table: persisted under `/placement_rule/{group}/{id}`,
/// held in memory sorted by `(group, index desc, id)`.
pub struct RuleManager {
    kv: Arc<dyn CoordKv>,
    rules: RwLock<Vec<Rule>>,
}

impl RuleManager {
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self {
            kv,
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Loads all persisted rules, seeding the default rule on a fresh
    /// cluster so there is always at least one.
    pub async fn load(&self, replication: &ReplicationConfig) -> Result<()> {
        let end = keys::range_end_of_prefix(keys::PLACEMENT_RULE_PREFIX);
        let mut rules = Vec::new();
        for kv in self
            .kv
            .load_range(keys::PLACEMENT_RULE_PREFIX, &end, 0)
            .await?
        {
            rules.push(codec::from_json_bytes::<Rule>(&kv.value)?);
        }
        if rules.is_empty() {
            let rule = default_rule(replication);
            self.kv
                .save(
                    &keys::placement_rule_path(&rule.group_id, &rule.id),
                    codec::to_json_bytes(&rule)?,
                )
                .await?;
            rules.push(rule);
        }
        sort_rules(&mut rules);
        let count = rules.len();
        *self.rules.write() = rules;
        info!(target: "placement", count, "placement rules loaded");
        Ok(())
    }

    /// Creates or replaces one rule.
    pub async fn set_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        self.kv
            .save(
                &keys::placement_rule_path(&rule.group_id, &rule.id),
                codec::to_json_bytes(&rule)?,
            )
            .await?;
        let mut rules = self.rules.write();
        rules.retain(|r| r.key() != rule.key());
        rules.push(rule);
        sort_rules(&mut rules);
        Ok(())
    }

    /// Deletes one rule.
    pub async fn delete_rule(&self, group_id: &str, id: &str) -> Result<()> {
        self.kv
            .remove(&keys::placement_rule_path(group_id, id))
            .await?;
        self.rules
            .write()
            .retain(|r| !(r.group_id == group_id && r.id == id));
        Ok(())
    }

    /// Every stored rule, in effective order.
    pub fn all_rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    /// The effective rule set for `region`: groups concatenate in group
    /// order, rules within a group run from highest index down, an
    /// override rule masks the rest of its group, and only rules covering
    /// the region's range apply.
    pub fn rules_for_region(&self, region: &RegionInfo) -> Vec<Rule> {
        let rules = self.rules.read();
        let mut effective = Vec::new();
        let mut masked_group: Option<String> = None;
        for rule in rules.iter() {
            if masked_group.as_deref() == Some(rule.group_id.as_str()) {
                continue;
            }
            if !rule.applies_to(&region.meta) {
                continue;
            }
            if rule.override_group {
                masked_group = Some(rule.group_id.clone());
            }
            effective.push(rule.clone());
        }
        effective
    }
}

fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        a.group_id
            .cmp(&b.group_id)
            .then(b.index.cmp(&a.index))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::rule::RuleRole;
    use meridian_store::MemStore;
    use meridian_types::{Peer, RegionMeta};

    fn rule(group: &str, id: &str, index: i64, override_group: bool) -> Rule {
        Rule {
            group_id: group.into(),
            id: id.into(),
            index,
            override_group,
            role: RuleRole::Voter,
            count: 3,
            ..Default::default()
        }
    }

    fn any_region() -> RegionInfo {
        RegionInfo::new(RegionMeta {
            id: 1,
            peers: vec![Peer::voter(1, 1)],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn fresh_cluster_gets_the_default_rule() {
        let mgr = RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>);
        mgr.load(&ReplicationConfig::default()).await.unwrap();
        let rules = mgr.all_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "default");
        assert_eq!(rules[0].count, 3);
    }

    #[tokio::test]
    async fn rules_survive_a_reload() {
        let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let mgr = RuleManager::new(Arc::clone(&kv));
        mgr.load(&ReplicationConfig::default()).await.unwrap();
        mgr.set_rule(rule("tenant", "hot", 5, false)).await.unwrap();

        let reloaded = RuleManager::new(kv);
        reloaded.load(&ReplicationConfig::default()).await.unwrap();
        assert_eq!(reloaded.all_rules().len(), 2);
    }

    #[tokio::test]
    async fn override_masks_the_rest_of_the_group() {
        let mgr = RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>);
        mgr.set_rule(rule("g", "low", 1, false)).await.unwrap();
        mgr.set_rule(rule("g", "high", 9, true)).await.unwrap();
        mgr.set_rule(rule("h", "other", 0, false)).await.unwrap();
        let effective = mgr.rules_for_region(&any_region());
        let ids: Vec<&str> = effective.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "other"]);
    }

    #[tokio::test]
    async fn range_scoped_rules_skip_foreign_regions() {
        let mgr = RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>);
        let mut scoped = rule("g", "scoped", 0, false);
        scoped.start_key = b"x".to_vec();
        scoped.end_key = b"z".to_vec();
        mgr.set_rule(scoped).await.unwrap();
        mgr.set_rule(rule("g", "global", -1, false)).await.unwrap();
        let effective = mgr.rules_for_region(&any_region());
        let ids: Vec<&str> = effective.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["global"]);
    }

    #[tokio::test]
    async fn delete_removes_from_memory_and_disk() {
        let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let mgr = RuleManager::new(Arc::clone(&kv));
        mgr.set_rule(rule("g", "r", 0, false)).await.unwrap();
        mgr.delete_rule("g", "r").await.unwrap();
        assert!(mgr.all_rules().is_empty());
        let reloaded = RuleManager::new(kv);
        reloaded.load(&ReplicationConfig::default()).await.unwrap();
        // Only the re-seeded default remains.
        assert_eq!(reloaded.all_rules().len(), 1);
    }
}
