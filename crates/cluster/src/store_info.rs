// Path: crates/cluster/src/store_info.rs
//! The in-memory view of one store.

use std::time::{Duration, Instant};

use meridian_types::stats::StoreStats;
use meridian_types::{StoreId, StoreMeta, StoreState};

/// One store as the control plane sees it. Like regions, store values are
/// replaced whole on update, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct StoreInfo {
    /// Persisted metadata.
    pub meta: StoreMeta,
    /// Latest heartbeat statistics.
    pub stats: StoreStats,
    /// When the latest heartbeat arrived.
    pub last_heartbeat: Option<Instant>,
    /// When the metadata was last persisted.
    pub last_persisted: Option<Instant>,
    /// Flagged slow by heartbeat slow scores.
    pub slow: bool,
    /// Refuses to receive leaders (set by evict-leader machinery).
    pub pause_leader_transfer_in: bool,
    /// Refuses to give up leaders.
    pub pause_leader_transfer_out: bool,
    /// Divisor on the leader balance score.
    pub leader_weight: f64,
    /// Divisor on the region balance score.
    pub region_weight: f64,
}

impl StoreInfo {
    /// Wraps fresh metadata with neutral weights.
    pub fn new(meta: StoreMeta) -> Self {
        Self {
            meta,
            leader_weight: 1.0,
            region_weight: 1.0,
            ..Default::default()
        }
    }

    pub fn id(&self) -> StoreId {
        self.meta.id
    }

    /// No heartbeat within `timeout`.
    pub fn is_disconnected(&self, timeout: Duration) -> bool {
        match self.last_heartbeat {
            Some(at) => at.elapsed() > timeout,
            None => true,
        }
    }

    /// No heartbeat for so long the store counts as down.
    pub fn is_down(&self, max_down: Duration) -> bool {
        self.is_disconnected(max_down)
    }

    /// Whether the store may receive new peers.
    pub fn can_accept_peers(&self, disconnect_timeout: Duration) -> bool {
        self.meta.state == StoreState::Up
            && !self.stats.is_busy
            && !self.is_disconnected(disconnect_timeout)
    }

    /// Whether the store may receive leaders.
    pub fn can_accept_leaders(&self, disconnect_timeout: Duration) -> bool {
        self.can_accept_peers(disconnect_timeout) && !self.pause_leader_transfer_in && !self.slow
    }

    /// Fraction of disk in use, in `[0, 1]`.
    pub fn usage(&self) -> f64 {
        if self.stats.capacity == 0 {
            return 0.0;
        }
        1.0 - (self.stats.available as f64 / self.stats.capacity as f64)
    }

    /// Leader balance score: count over weight.
    pub fn leader_score(&self, leader_count: u64) -> f64 {
        leader_count as f64 / self.leader_weight.max(f64::EPSILON)
    }

    /// Region balance score: usage-weighted count over weight.
    pub fn region_score(&self, region_count: u64) -> f64 {
        let load_factor = 1.0 + self.usage();
        region_count as f64 * load_factor / self.region_weight.max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_heartbeated_store_is_disconnected() {
        let s = StoreInfo::new(StoreMeta {
            id: 1,
            ..Default::default()
        });
        assert!(s.is_disconnected(Duration::from_secs(20)));
    }

    #[test]
    fn weights_divide_scores() {
        let mut s = StoreInfo::new(StoreMeta::default());
        s.leader_weight = 2.0;
        assert_eq!(s.leader_score(10), 5.0);
    }

    #[test]
    fn paused_store_rejects_leaders_only() {
        let mut s = StoreInfo::new(StoreMeta {
            id: 1,
            state: StoreState::Up,
            ..Default::default()
        });
        s.last_heartbeat = Some(Instant::now());
        s.pause_leader_transfer_in = true;
        assert!(s.can_accept_peers(Duration::from_secs(20)));
        assert!(!s.can_accept_leaders(Duration::from_secs(20)));
    }
}
