//! Tiered response cache backing the shadow file store.
//!
//! This module provides:
//! - Two named tiers, ephemeral and persistent, with versioned store names
//! - Ordered lookup across tiers (first hit wins)
//! - A SQLite content store keyed by normalized request identity

mod storage;
#[cfg(test)]
pub(crate) mod testing;
mod tiers;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use tiers::{TierHandle, TierManager};
pub use traits::{CachedResponse, RequestKey, StoredResponse, Tier, TierHit};
