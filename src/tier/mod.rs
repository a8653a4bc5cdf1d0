//! Storage tiers.
//!
//! - [`memory`]: bounded in-process LRU store (L1)
//! - [`distributed`]: Redis-backed store with native expiry (L2)
//! - [`persistent`]: disk blobs with an embedded index (L3)

pub mod distributed;
pub mod memory;
pub mod persistent;

use serde::{Deserialize, Serialize};

/// Identifies one of the three storage levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierLevel {
    /// L1: in-process memory (hot).
    Memory,
    /// L2: external distributed store (warm).
    Distributed,
    /// L3: local disk (cold).
    Persistent,
}

impl TierLevel {
    /// All tiers, fastest first.
    pub const ALL: [TierLevel; 3] = [
        TierLevel::Memory,
        TierLevel::Distributed,
        TierLevel::Persistent,
    ];

    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            TierLevel::Memory => 1,
            TierLevel::Distributed => 2,
            TierLevel::Persistent => 3,
        }
    }
}

impl std::fmt::Display for TierLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierLevel::Memory => write!(f, "L1"),
            TierLevel::Distributed => write!(f, "L2"),
            TierLevel::Persistent => write!(f, "L3"),
        }
    }
}

/// Metadata returned alongside a payload read from a lower tier, carried
/// forward when the value is promoted.
#[derive(Debug, Clone, Default)]
pub struct EntryInfo {
    /// TTL the entry was stored with, in seconds.
    pub ttl_secs: Option<u64>,

    /// Tags attached at set time.
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert_eq!(TierLevel::Memory.level(), 1);
        assert_eq!(TierLevel::Persistent.level(), 3);
        assert_eq!(TierLevel::ALL[0], TierLevel::Memory);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(TierLevel::Distributed.to_string(), "L2");
    }
}
