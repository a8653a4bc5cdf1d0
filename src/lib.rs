//! tiercache: multi-tier intelligent cache engine.
//!
//! Keeps hot values in a bounded in-process LRU (L1), warm values in an
//! external Redis-compatible store (L2, optional), and cold values on disk
//! as hash-named blob files with an embedded index (L3).
//!
//! Reads probe L1 → L2 → L3 and promote hits into the faster tiers; writes
//! pick a target tier from a size/TTL heuristic. An access-pattern analyzer
//! tracks per-key request regularity to tune TTLs and drive predictive
//! preloading, and a background maintenance scheduler sweeps expired
//! entries without touching the request path.

pub mod analyzer;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod maintenance;
pub mod metrics;
pub mod tier;

pub use codec::{Codec, JsonCodec};
pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, SetOptions};
pub use tier::TierLevel;
