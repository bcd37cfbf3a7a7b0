// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

// Layer 3: Internal module imports
use crate::error::BrokerError;

/// Permit pool snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermitStats {
    /// Pool size
    pub total: u64,
    /// Permits currently granted
    pub allocated: u64,
    /// Permits currently free
    pub available: u64,
}

/// Result of a grant request. Partial grants are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantOutcome {
    /// Permits actually granted, `min(requested, available)`
    pub granted: u64,
    /// Pool availability after the grant
    pub available: u64,
}

/// Result of a release. The released count is clamped to the provider's
/// allocation; the pool never reports `available > total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Permits actually returned to the pool
    pub released: u64,
    /// Pool availability after the release
    pub available: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    allocated: u64,
    providers: HashMap<String, u64>,
}

/// Global permit pool with a per-provider allocation ledger.
///
/// All operations take one short internal lock and are O(providers) at
/// worst; permit traffic is rare next to message throughput.
///
/// # Invariants
///
/// `allocated == Σ providers`, `available == total - allocated`, and every
/// count stays non-negative, across any sequence of request / release /
/// revoke operations.
///
/// # Example
///
/// ```rust
/// use procbus_broker::PermitManager;
///
/// let permits = PermitManager::new(10);
/// let grant = permits.request("etl-1", 7).unwrap();
/// assert_eq!(grant.granted, 7);
/// assert_eq!(grant.available, 3);
///
/// // The pool grants what it can.
/// let grant = permits.request("etl-1", 5).unwrap();
/// assert_eq!(grant.granted, 3);
/// assert_eq!(grant.available, 0);
/// ```
#[derive(Debug)]
pub struct PermitManager {
    total: u64,
    ledger: Mutex<Ledger>,
}

impl PermitManager {
    /// Create a pool of `total` permits, all available.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Grant up to `count` permits to `provider_id`.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::InvalidArgument`] on an empty provider or zero count
    /// - [`BrokerError::NoPermits`] when the pool is exhausted
    pub fn request(&self, provider_id: &str, count: u64) -> Result<GrantOutcome, BrokerError> {
        if provider_id.is_empty() {
            return Err(BrokerError::InvalidArgument {
                reason: "provider_id must not be empty".to_string(),
            });
        }
        if count == 0 {
            return Err(BrokerError::InvalidArgument {
                reason: "permit_count must be positive".to_string(),
            });
        }

        let mut ledger = self.ledger.lock();
        let available = self.total - ledger.allocated;
        if available == 0 {
            return Err(BrokerError::NoPermits);
        }

        let granted = count.min(available);
        ledger.allocated += granted;
        *ledger.providers.entry(provider_id.to_string()).or_insert(0) += granted;

        info!(provider = %provider_id, granted, available = available - granted, "permits granted");
        Ok(GrantOutcome {
            granted,
            available: available - granted,
        })
    }

    /// Return up to `count` permits held by `provider_id` to the pool.
    ///
    /// Releases beyond the provider's allocation are clamped; a provider
    /// with no ledger entry is an error.
    pub fn release(&self, provider_id: &str, count: u64) -> Result<ReleaseOutcome, BrokerError> {
        if provider_id.is_empty() {
            return Err(BrokerError::InvalidArgument {
                reason: "provider_id must not be empty".to_string(),
            });
        }
        if count == 0 {
            return Err(BrokerError::InvalidArgument {
                reason: "permit_count must be positive".to_string(),
            });
        }

        let mut ledger = self.ledger.lock();
        let Some(held) = ledger.providers.get(provider_id).copied() else {
            return Err(BrokerError::ProviderNotFound {
                provider_id: provider_id.to_string(),
            });
        };

        let released = count.min(held);
        if released == held {
            ledger.providers.remove(provider_id);
        } else if let Some(entry) = ledger.providers.get_mut(provider_id) {
            *entry = held - released;
        }
        ledger.allocated -= released;

        info!(provider = %provider_id, released, available = self.total - ledger.allocated, "permits released");
        Ok(ReleaseOutcome {
            released,
            available: self.total - ledger.allocated,
        })
    }

    /// Revoke `count` permits proportionally across providers.
    ///
    /// Selection is by largest remainder over each provider's share of the
    /// allocation; every selected provider loses at least one permit, until
    /// `count` are removed or no allocation remains. Returns the
    /// per-provider revocation map.
    pub fn revoke(&self, count: u64) -> HashMap<String, u64> {
        let mut ledger = self.ledger.lock();
        let allocated = ledger.allocated;
        if count == 0 || allocated == 0 {
            return HashMap::new();
        }
        let count = count.min(allocated);

        // Largest-remainder apportionment of `count` across allocations.
        let mut shares: Vec<(String, u64, u64, u64)> = ledger
            .providers
            .iter()
            .map(|(id, held)| {
                let exact = held * count;
                (id.clone(), *held, exact / allocated, exact % allocated)
            })
            .collect();

        let assigned: u64 = shares.iter().map(|(_, _, base, _)| base).sum();
        let mut leftover = count - assigned;

        // Hand remainders out largest-first; ties break toward the larger
        // holder, then lexicographically for determinism.
        shares.sort_by(|a, b| b.3.cmp(&a.3).then(b.1.cmp(&a.1)).then(a.0.cmp(&b.0)));
        for share in shares.iter_mut() {
            if leftover == 0 {
                break;
            }
            if share.2 < share.1 {
                share.2 += 1;
                leftover -= 1;
            }
        }

        let mut revoked = HashMap::new();
        for (id, held, take, _) in shares {
            if take == 0 {
                continue;
            }
            if take == held {
                ledger.providers.remove(&id);
            } else if let Some(entry) = ledger.providers.get_mut(&id) {
                *entry = held - take;
            }
            ledger.allocated -= take;
            revoked.insert(id, take);
        }

        info!(requested = count, revoked = ?revoked, "permits revoked");
        revoked
    }

    /// Current pool snapshot.
    pub fn stats(&self) -> PermitStats {
        let ledger = self.ledger.lock();
        PermitStats {
            total: self.total,
            allocated: ledger.allocated,
            available: self.total - ledger.allocated,
        }
    }

    /// Providers with a live ledger entry.
    pub fn providers(&self) -> Vec<String> {
        self.ledger.lock().providers.keys().cloned().collect()
    }

    /// Permits currently held by `provider_id`.
    pub fn allocated_to(&self, provider_id: &str) -> u64 {
        self.ledger
            .lock()
            .providers
            .get(provider_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_partial_grant_lifecycle() {
        let permits = PermitManager::new(10);

        let grant = permits.request("p", 7).unwrap();
        assert_eq!((grant.granted, grant.available), (7, 3));

        let grant = permits.request("p", 5).unwrap();
        assert_eq!((grant.granted, grant.available), (3, 0));

        let release = permits.release("p", 4).unwrap();
        assert_eq!((release.released, release.available), (4, 4));

        let err = permits.release("q", 1).unwrap_err();
        assert!(matches!(err, BrokerError::ProviderNotFound { provider_id } if provider_id == "q"));
    }

    #[test]
    fn test_exhausted_pool_reports_no_permits() {
        let permits = PermitManager::new(2);
        permits.request("p", 2).unwrap();
        assert!(matches!(permits.request("q", 1), Err(BrokerError::NoPermits)));
    }

    #[test]
    fn test_invalid_arguments() {
        let permits = PermitManager::new(5);
        assert!(matches!(
            permits.request("", 1),
            Err(BrokerError::InvalidArgument { .. })
        ));
        assert!(matches!(
            permits.request("p", 0),
            Err(BrokerError::InvalidArgument { .. })
        ));
        assert!(matches!(
            permits.release("", 1),
            Err(BrokerError::InvalidArgument { .. })
        ));
        assert!(matches!(
            permits.release("p", 0),
            Err(BrokerError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_release_clamps_to_allocation() {
        let permits = PermitManager::new(10);
        permits.request("p", 4).unwrap();

        let release = permits.release("p", 100).unwrap();
        assert_eq!(release.released, 4);
        assert_eq!(release.available, 10);

        // Entry is gone now, so a second release cannot go negative.
        assert!(matches!(
            permits.release("p", 1),
            Err(BrokerError::ProviderNotFound { .. })
        ));
    }

    #[test]
    fn test_revoke_single_provider() {
        let permits = PermitManager::new(10);
        permits.request("p", 10).unwrap();

        let revoked = permits.revoke(2);
        assert_eq!(revoked["p"], 2);
        let stats = permits.stats();
        assert_eq!(stats.allocated, 8);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn test_revoke_proportional_across_providers() {
        let permits = PermitManager::new(100);
        permits.request("big", 60).unwrap();
        permits.request("mid", 30).unwrap();
        permits.request("small", 10).unwrap();

        let revoked = permits.revoke(10);
        let removed: u64 = revoked.values().sum();
        assert_eq!(removed, 10);
        assert_eq!(revoked["big"], 6);
        assert_eq!(revoked["mid"], 3);
        assert_eq!(revoked["small"], 1);
        assert_eq!(permits.stats().allocated, 90);
    }

    #[test]
    fn test_revoke_more_than_allocated_clears_pool() {
        let permits = PermitManager::new(10);
        permits.request("a", 3).unwrap();
        permits.request("b", 2).unwrap();

        let revoked = permits.revoke(50);
        assert_eq!(revoked.values().sum::<u64>(), 5);
        assert_eq!(permits.stats().allocated, 0);
        assert!(permits.providers().is_empty());
    }

    #[test]
    fn test_revoke_nothing_allocated() {
        let permits = PermitManager::new(10);
        assert!(permits.revoke(3).is_empty());
    }

    #[test]
    fn test_selected_providers_lose_at_least_one() {
        let permits = PermitManager::new(100);
        permits.request("a", 97).unwrap();
        permits.request("b", 3).unwrap();

        // b's proportional share of 5 rounds below 1; the remainder pass
        // still takes a whole permit from whoever it selects.
        let revoked = permits.revoke(5);
        assert_eq!(revoked.values().sum::<u64>(), 5);
        assert!(revoked.values().all(|&n| n >= 1));
    }

    proptest! {
        #[test]
        fn prop_ledger_invariant_holds(ops in proptest::collection::vec(
            (0u8..3, 0usize..4, 1u64..20), 1..64
        )) {
            let permits = PermitManager::new(32);
            let names = ["a", "b", "c", "d"];

            for (op, who, count) in ops {
                let provider = names[who];
                match op {
                    0 => { let _ = permits.request(provider, count); }
                    1 => { let _ = permits.release(provider, count); }
                    _ => { let _ = permits.revoke(count); }
                }

                let stats = permits.stats();
                prop_assert_eq!(stats.total, 32);
                prop_assert_eq!(stats.allocated + stats.available, 32);
                let sum: u64 = permits
                    .providers()
                    .iter()
                    .map(|p| permits.allocated_to(p))
                    .sum();
                prop_assert_eq!(sum, stats.allocated);
            }
        }
    }
}
