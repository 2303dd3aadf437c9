// Path: crates/schedule/src/placement/rule.rs
//! The rule shape and store matching.

use meridian_cluster::StoreInfo;
use meridian_types::config::ReplicationConfig;
use meridian_types::{Key, PdError, Peer, PeerRole, RegionMeta, Result};
use serde::{Deserialize, Serialize};

/// The role a rule demands of its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleRole {
    /// Full voting replicas.
    #[default]
    Voter,
    /// Voting replicas that should not lead.
    Follower,
    /// The replica that should lead.
    Leader,
    /// Non-voting replicas.
    Learner,
}

impl RuleRole {
    /// Whether a peer's consensus role can satisfy this rule role.
    pub fn accepts(&self, role: PeerRole) -> bool {
        match self {
            RuleRole::Learner => role == PeerRole::Learner,
            RuleRole::Voter | RuleRole::Follower | RuleRole::Leader => role.is_voter(),
        }
    }
}

/// Operator of a label constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelConstraintOp {
    In,
    NotIn,
    Exists,
    NotExists,
}

/// One constraint against a store's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConstraint {
    pub key: String,
    pub op: LabelConstraintOp,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelConstraint {
    pub fn matches(&self, store: &StoreInfo) -> bool {
        let value = store.meta.label(&self.key);
        match self.op {
            LabelConstraintOp::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            LabelConstraintOp::NotIn => !value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            LabelConstraintOp::Exists => value.is_some(),
            LabelConstraintOp::NotExists => value.is_none(),
        }
    }
}

/// One placement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Rule {
    /// Rules are grouped; groups concatenate in group-ID order.
    pub group_id: String,
    /// Unique within the group.
    pub id: String,
    /// Ordering within the group, highest first.
    pub index: i64,
    /// Masks every lower-index rule in the same group.
    #[serde(rename = "override", default)]
    pub override_group: bool,
    /// Key range the rule governs; empty bounds mean open.
    #[serde(default)]
    pub start_key: Key,
    #[serde(default)]
    pub end_key: Key,
    /// Demanded role.
    pub role: RuleRole,
    /// How many peers the rule wants.
    pub count: usize,
    /// Store label constraints.
    #[serde(default)]
    pub label_constraints: Vec<LabelConstraint>,
    /// Ordered labels for isolation diversification.
    #[serde(default)]
    pub location_labels: Vec<String>,
    /// Label key replicas must differ on; empty disables.
    #[serde(default)]
    pub isolation_level: String,
    /// Whether the rule's peers are witnesses.
    #[serde(default)]
    pub is_witness: bool,
}

impl Rule {
    /// Stable identity of the rule.
    pub fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.id.clone())
    }

    /// Shape validation for admin writes.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() || self.id.is_empty() {
            return Err(PdError::InvalidInput("rule group and id must be set".into()));
        }
        if self.count == 0 {
            return Err(PdError::InvalidInput(format!(
                "rule {}/{} must have count >= 1",
                self.group_id, self.id
            )));
        }
        if self.is_witness && self.role == RuleRole::Leader {
            return Err(PdError::InvalidInput(
                "a witness cannot be required to lead".into(),
            ));
        }
        Ok(())
    }

    /// Whether the rule governs `region` (the region's range must sit
    /// inside the rule's range).
    pub fn applies_to(&self, region: &RegionMeta) -> bool {
        let starts_ok = self.start_key.as_slice() <= region.start_key.as_slice();
        let ends_ok = self.end_key.is_empty()
            || (!region.end_key.is_empty() && region.end_key.as_slice() <= self.end_key.as_slice());
        starts_ok && ends_ok
    }

    /// Whether `store` can host a peer of this rule.
    pub fn matches_store(&self, store: &StoreInfo) -> bool {
        self.label_constraints.iter().all(|c| c.matches(store))
    }

    /// Whether `peer` already satisfies the rule's role and witness flag.
    pub fn peer_conforms(&self, peer: &Peer) -> bool {
        self.role.accepts(peer.role) && peer.is_witness == self.is_witness
    }
}

/// The implicit rule when none are configured: `count` voters anywhere,
/// diversified over the configured location labels.
pub fn default_rule(replication: &ReplicationConfig) -> Rule {
    Rule {
        group_id: "pd".to_string(),
        id: "default".to_string(),
        index: 0,
        role: RuleRole::Voter,
        count: replication.max_replicas,
        location_labels: replication.location_labels.clone(),
        isolation_level: replication.isolation_level.clone(),
        ..Default::default()
    }
}
