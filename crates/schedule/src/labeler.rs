// Path: crates/schedule/src/labeler.rs
//! Region label rules: operator-declared labels over key ranges.
//!
//! The scheduling engine consults the labeler before acting; a covering
//! rule carrying `schedule=deny` fences its ranges off from every
//! scheduler-produced operator. Labels may carry a TTL; a background GC
//! prunes the expired ones.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_cluster::RegionInfo;
use meridian_store::CoordKv;
use meridian_types::config::KeyRange;
use meridian_types::{codec, keys, PdError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

const GC_INTERVAL: Duration = Duration::from_secs(30);

/// The label key whose `deny` value fences scheduling.
pub const SCHEDULE_LABEL_KEY: &str = "schedule";
/// The fencing value.
pub const SCHEDULE_DENY: &str = "deny";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One label, optionally time-bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLabel {
    pub key: String,
    pub value: String,
    /// Seconds of validity from `start_at`; `None` means forever.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Unix seconds the TTL counts from.
    #[serde(default)]
    pub start_at: u64,
}

impl RegionLabel {
    pub fn forever(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl_secs: None,
            start_at: unix_now(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl_secs {
            Some(ttl) => self.start_at + ttl <= now,
            None => false,
        }
    }
}

/// One label rule: labels applied to a set of key ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub id: String,
    /// Higher index wins when rules overlap.
    #[serde(default)]
    pub index: i64,
    pub labels: Vec<RegionLabel>,
    /// Only `key-range` is defined today.
    pub rule_type: String,
    pub ranges: Vec<KeyRange>,
}

impl LabelRule {
    fn covers(&self, region: &RegionInfo) -> bool {
        self.ranges
            .iter()
            .any(|r| r.covers(region.start_key(), region.end_key()))
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(PdError::InvalidInput("label rule id must be set".into()));
        }
        if self.rule_type != "key-range" {
            return Err(PdError::InvalidInput(format!(
                "unknown label rule type {:?}",
                self.rule_type
            )));
        }
        if self.labels.is_empty() {
            return Err(PdError::InvalidInput("label rule needs labels".into()));
        }
        Ok(())
    }
}

/// The label rule table.
pub struct RegionLabeler {
    kv: Arc<dyn CoordKv>,
    rules: RwLock<Vec<LabelRule>>,
}

impl RegionLabeler {
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self {
            kv,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let end = keys::range_end_of_prefix(keys::REGION_LABEL_PREFIX);
        let mut rules = Vec::new();
        for kv in self.kv.load_range(keys::REGION_LABEL_PREFIX, &end, 0).await? {
            rules.push(codec::from_json_bytes::<LabelRule>(&kv.value)?);
        }
        rules.sort_by(|a, b| b.index.cmp(&a.index).then(a.id.cmp(&b.id)));
        let count = rules.len();
        *self.rules.write() = rules;
        info!(target: "labeler", count, "region label rules loaded");
        Ok(())
    }

    pub async fn set_rule(&self, rule: LabelRule) -> Result<()> {
        rule.validate()?;
        self.kv
            .save(&keys::region_label_path(&rule.id), codec::to_json_bytes(&rule)?)
            .await?;
        let mut rules = self.rules.write();
        rules.retain(|r| r.id != rule.id);
        rules.push(rule);
        rules.sort_by(|a, b| b.index.cmp(&a.index).then(a.id.cmp(&b.id)));
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        self.kv.remove(&keys::region_label_path(id)).await?;
        self.rules.write().retain(|r| r.id != id);
        Ok(())
    }

    pub fn all_rules(&self) -> Vec<LabelRule> {
        self.rules.read().clone()
    }

    /// The value of `key` for `region`: the highest-index covering rule
    /// with a live label wins.
    pub fn region_label(&self, region: &RegionInfo, key: &str) -> Option<String> {
        let now = unix_now();
        self.rules
            .read()
            .iter()
            .filter(|r| r.covers(region))
            .flat_map(|r| r.labels.iter())
            .find(|l| l.key == key && !l.is_expired(now))
            .map(|l| l.value.clone())
    }

    /// Whether any covering rule fences scheduling off.
    pub fn schedule_disabled(&self, region: &RegionInfo) -> bool {
        self.region_label(region, SCHEDULE_LABEL_KEY)
            .is_some_and(|v| v == SCHEDULE_DENY)
    }

    /// Drops expired labels, deleting rules left empty. Returns the number
    /// of rules removed.
    pub async fn gc(&self) -> Result<usize> {
        let now = unix_now();
        let (kept, doomed): (Vec<LabelRule>, Vec<LabelRule>) = {
            let rules = self.rules.read();
            let mut kept = Vec::new();
            let mut doomed = Vec::new();
            for rule in rules.iter() {
                let mut pruned = rule.clone();
                pruned.labels.retain(|l| !l.is_expired(now));
                if pruned.labels.is_empty() {
                    doomed.push(rule.clone());
                } else {
                    kept.push(pruned);
                }
            }
            (kept, doomed)
        };
        for rule in &doomed {
            self.kv.remove(&keys::region_label_path(&rule.id)).await?;
        }
        let removed = doomed.len();
        *self.rules.write() = kept;
        if removed > 0 {
            info!(target: "labeler", removed, "expired label rules pruned");
        }
        Ok(removed)
    }

    pub fn spawn_gc_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let labeler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = labeler.gc().await {
                            warn!(target: "labeler", error = %e, "label gc failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::MemStore;
    use meridian_types::{Peer, RegionMeta};

    fn region(start: &[u8], end: &[u8]) -> RegionInfo {
        RegionInfo::new(RegionMeta {
            id: 1,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            peers: vec![Peer::voter(1, 1)],
            ..Default::default()
        })
    }

    fn deny_rule(id: &str, index: i64, start: &[u8], end: &[u8]) -> LabelRule {
        LabelRule {
            id: id.into(),
            index,
            labels: vec![RegionLabel::forever(SCHEDULE_LABEL_KEY, SCHEDULE_DENY)],
            rule_type: "key-range".into(),
            ranges: vec![KeyRange {
                start_key: start.to_vec(),
                end_key: end.to_vec(),
            }],
        }
    }

    #[tokio::test]
    async fn deny_ranges_fence_scheduling() {
        let labeler = RegionLabeler::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>);
        labeler.set_rule(deny_rule("fence", 0, b"b", b"m")).await.unwrap();
        assert!(labeler.schedule_disabled(&region(b"c", b"d")));
        assert!(!labeler.schedule_disabled(&region(b"m", b"z")));
        // A region straddling the fence boundary is not covered.
        assert!(!labeler.schedule_disabled(&region(b"a", b"c")));
    }

    #[tokio::test]
    async fn higher_index_rule_wins() {
        let labeler = RegionLabeler::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>);
        let mut allow = deny_rule("allow", 5, b"", b"");
        allow.labels = vec![RegionLabel::forever(SCHEDULE_LABEL_KEY, "allow")];
        labeler.set_rule(deny_rule("deny", 1, b"", b"")).await.unwrap();
        labeler.set_rule(allow).await.unwrap();
        assert_eq!(
            labeler.region_label(&region(b"a", b"b"), SCHEDULE_LABEL_KEY),
            Some("allow".to_string())
        );
        assert!(!labeler.schedule_disabled(&region(b"a", b"b")));
    }

    #[tokio::test]
    async fn gc_drops_expired_rules() {
        let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let labeler = RegionLabeler::new(Arc::clone(&kv));
        let mut rule = deny_rule("ttl", 0, b"", b"");
        rule.labels[0].ttl_secs = Some(1);
        rule.labels[0].start_at = 0; // long past
        labeler.set_rule(rule).await.unwrap();
        assert_eq!(labeler.gc().await.unwrap(), 1);
        assert!(labeler.all_rules().is_empty());

        let reloaded = RegionLabeler::new(kv);
        reloaded.load().await.unwrap();
        assert!(reloaded.all_rules().is_empty());
    }
}
