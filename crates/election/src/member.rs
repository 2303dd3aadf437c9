// Path: crates/election/src/member.rs
//! Participant identity.

use serde::{Deserialize, Serialize};

use meridian_types::{codec, Result};

/// Identity of one PD replica, serialized as the value of the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable numeric ID, derived from the name.
    pub id: u64,
    /// Replica name, unique within the PD cluster.
    pub name: String,
    /// URLs clients use to reach this replica.
    pub client_urls: Vec<String>,
}

impl Member {
    /// Builds a member, deriving the numeric ID from the name.
    pub fn new(name: impl Into<String>, client_urls: Vec<String>) -> Self {
        let name = name.into();
        Self {
            id: fnv1a(name.as_bytes()),
            name,
            client_urls,
        }
    }

    /// The address clients should be redirected to.
    pub fn primary_url(&self) -> Option<&str> {
        self.client_urls.first().map(|s| s.as_str())
    }

    /// Serializes the identity for the leader key.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::to_json_bytes(self)
    }

    /// Parses an identity from a leader key value.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        codec::from_json_bytes(b)
    }
}

// 64-bit FNV-1a; stable across processes and releases, which is all the
// member ID needs.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_per_name() {
        let a = Member::new("pd-1", vec!["mock://pd-1".into()]);
        let b = Member::new("pd-1", vec!["mock://elsewhere".into()]);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, Member::new("pd-2", vec![]).id);
    }

    #[test]
    fn identity_round_trips() {
        let m = Member::new("pd-1", vec!["mock://pd-1".into()]);
        assert_eq!(Member::from_bytes(&m.to_bytes().unwrap()).unwrap(), m);
    }
}
