//! Pure tier selection for facade writes.

use crate::config::StoragePolicy;
use crate::core::{Result, VaultError};
use serde::{Deserialize, Serialize};

/// Where a single write is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteStrategy {
    /// Per-session store, honoring the entry's TTL.
    Ephemeral,
    /// Durable small-object store.
    Small,
    /// Durable large-object store.
    Large,
    /// Fixed-size chunks in the large store plus a manifest in the small store.
    Distributed,
}

/// Caller flags that influence [`select_strategy`].
#[derive(Debug, Clone, Default)]
pub struct WriteFlags {
    pub temporary: bool,
    pub ttl_ms: Option<u64>,
    pub force_local: bool,
    pub prefer_large: bool,
    /// Bypasses the absolute payload cap.
    pub force: bool,
}

impl WriteFlags {
    pub fn temporary(ttl_ms: Option<u64>) -> Self {
        Self {
            temporary: true,
            ttl_ms,
            ..Self::default()
        }
    }

    pub fn force_local() -> Self {
        Self {
            force_local: true,
            ..Self::default()
        }
    }

    pub fn prefer_large() -> Self {
        Self {
            prefer_large: true,
            ..Self::default()
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.temporary || self.ttl_ms.is_some()
    }
}

/// Picks exactly one persistence strategy from the serialized size and flags.
///
/// Precedence: temporary/ttl, force-local, explicit large, then size bands.
pub fn select_strategy(size: usize, flags: &WriteFlags, policy: &StoragePolicy) -> WriteStrategy {
    if flags.is_ephemeral() {
        return WriteStrategy::Ephemeral;
    }
    if flags.force_local {
        return WriteStrategy::Small;
    }
    if flags.prefer_large || size > policy.large_store_threshold_bytes {
        return WriteStrategy::Large;
    }
    if size > policy.small_store_max_bytes {
        return WriteStrategy::Distributed;
    }
    WriteStrategy::Small
}

/// Fails fast on payloads above the absolute cap unless the write is forced.
pub fn check_payload_cap(size: usize, flags: &WriteFlags, policy: &StoragePolicy) -> Result<()> {
    if size > policy.max_payload_bytes && !flags.force {
        return Err(VaultError::PayloadTooLarge {
            size,
            cap: policy.max_payload_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;

    #[test]
    fn size_bands_pick_one_tier() {
        let policy = StoragePolicy::default();
        let flags = WriteFlags::default();
        assert_eq!(select_strategy(10, &flags, &policy), WriteStrategy::Small);
        assert_eq!(select_strategy(100 * KB, &flags, &policy), WriteStrategy::Small);
        assert_eq!(
            select_strategy(100 * KB + 1, &flags, &policy),
            WriteStrategy::Distributed
        );
        assert_eq!(
            select_strategy(1024 * KB, &flags, &policy),
            WriteStrategy::Distributed
        );
        assert_eq!(
            select_strategy(1024 * KB + 1, &flags, &policy),
            WriteStrategy::Large
        );
    }

    #[test]
    fn flags_take_precedence_over_size() {
        let policy = StoragePolicy::default();
        let big = 5 * 1024 * KB;
        assert_eq!(
            select_strategy(big, &WriteFlags::temporary(None), &policy),
            WriteStrategy::Ephemeral
        );
        let ttl = WriteFlags {
            ttl_ms: Some(1000),
            force_local: true,
            ..WriteFlags::default()
        };
        assert_eq!(select_strategy(10, &ttl, &policy), WriteStrategy::Ephemeral);
        assert_eq!(
            select_strategy(big, &WriteFlags::force_local(), &policy),
            WriteStrategy::Small
        );
        assert_eq!(
            select_strategy(10, &WriteFlags::prefer_large(), &policy),
            WriteStrategy::Large
        );
    }

    #[test]
    fn payload_cap_respects_force() {
        let policy = StoragePolicy::default();
        let size = policy.max_payload_bytes + 1;
        assert!(check_payload_cap(size, &WriteFlags::default(), &policy).is_err());
        let forced = WriteFlags {
            force: true,
            ..WriteFlags::default()
        };
        assert!(check_payload_cap(size, &forced, &policy).is_ok());
    }
}
