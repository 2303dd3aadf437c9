// Path: crates/types/src/error.rs
//! Core error taxonomy for the Meridian placement driver.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// The error taxonomy shared by every Meridian component.
///
/// Variants are grouped by how a client is expected to react: redirect,
/// give up, recreate, or retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PdError {
    /// The local replica is not the primary; retriable by redirecting to
    /// the carried leader address, when one is known.
    #[error("not leader{}", .leader.as_deref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader {
        /// Address of the current primary, if the replica knows one.
        leader: Option<String>,
    },
    /// The request header carried a cluster ID other than ours.
    #[error("cluster mismatch: expected {expected}, got {got}")]
    ClusterMismatch {
        /// The cluster ID this server belongs to.
        expected: u64,
        /// The cluster ID carried by the request.
        got: u64,
    },
    /// A second bootstrap attempt on an already-bootstrapped cluster.
    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,
    /// The cluster has not been bootstrapped yet.
    #[error("cluster is not bootstrapped")]
    NotBootstrapped,
    /// No region with the given ID (or covering the given key) exists.
    #[error("region {0} not found")]
    RegionNotFound(u64),
    /// No store with the given ID exists.
    #[error("store {0} not found")]
    StoreNotFound(u64),
    /// No resource group with the given name exists.
    #[error("resource group {0:?} not found")]
    ResourceGroupNotFound(String),
    /// A region update carried an epoch older than the stored one.
    /// Dropped after a warn-level log; state is left unchanged.
    #[error("stale update for region {region_id}: ({conf_ver}, {version}) is behind the stored epoch")]
    Stale {
        /// The region the update addressed.
        region_id: u64,
        /// Submitted conf change epoch.
        conf_ver: u64,
        /// Submitted split/merge epoch.
        version: u64,
    },
    /// An optimistic transaction against the Coordination Store lost a
    /// race; retried at the call site up to a bounded count.
    #[error("coordination store transaction conflict")]
    TxnConflict,
    /// The Coordination Store is unreachable or failing. Persisting past
    /// the lease window causes step-down.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    /// Validation failure on caller-supplied input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Admission denied by a per-store or per-tenant limiter.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Programmer error. Aborts the process during startup; logged and
    /// survived in steady state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode for PdError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotLeader { .. } => "PD_NOT_LEADER",
            Self::ClusterMismatch { .. } => "PD_CLUSTER_MISMATCH",
            Self::AlreadyBootstrapped => "PD_ALREADY_BOOTSTRAPPED",
            Self::NotBootstrapped => "PD_NOT_BOOTSTRAPPED",
            Self::RegionNotFound(_) => "PD_REGION_NOT_FOUND",
            Self::StoreNotFound(_) => "PD_STORE_NOT_FOUND",
            Self::ResourceGroupNotFound(_) => "PD_RESOURCE_GROUP_NOT_FOUND",
            Self::Stale { .. } => "PD_STALE",
            Self::TxnConflict => "PD_TXN_CONFLICT",
            Self::Unavailable(_) => "PD_UNAVAILABLE",
            Self::InvalidInput(_) => "PD_INVALID_INPUT",
            Self::RateLimited(_) => "PD_RATE_LIMITED",
            Self::Internal(_) => "PD_INTERNAL",
        }
    }
}

impl PdError {
    /// Whether a client may retry the same request against another replica.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::TxnConflict | Self::Unavailable(_)
        )
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, PdError>;
