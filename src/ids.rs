//! Message identifier registry
//!
//! Allocates 16-bit identifiers for in-flight sender operations and maps
//! each identifier to the flow awaiting its terminating ack. Identifiers
//! are issued by a sweeping counter from the last allocation, skipping
//! identifiers still outstanding, and are never 0.

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::protocol::ClientError;
use crate::token::PendingAck;

struct Inner {
    index: AHashMap<u16, PendingAck>,
    last_issued: u16,
}

/// Registry of outstanding message identifiers
pub struct IdRegistry {
    inner: Mutex<Inner>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                index: AHashMap::with_capacity(16),
                last_issued: 0,
            }),
        }
    }

    /// Allocate a fresh identifier in `[1, 65535]` and record the pending
    /// flow under it. Returns `NoIdsAvailable` when every identifier is
    /// outstanding.
    pub(crate) fn allocate(&self, pending: PendingAck) -> Result<u16, ClientError> {
        let mut inner = self.inner.lock();
        if inner.index.len() >= u16::MAX as usize {
            return Err(ClientError::NoIdsAvailable);
        }

        let mut id = inner.last_issued;
        loop {
            id = if id == u16::MAX { 1 } else { id + 1 };
            if !inner.index.contains_key(&id) {
                break;
            }
        }

        inner.last_issued = id;
        inner.index.insert(id, pending);
        Ok(id)
    }

    /// Look up the flow pending on `id`, if any. Non-mutating.
    pub(crate) fn lookup(&self, id: u16) -> Option<PendingAck> {
        self.inner.lock().index.get(&id).cloned()
    }

    /// Release `id` back to the pool. Safe to call on unknown identifiers.
    pub fn free(&self, id: u16) {
        self.inner.lock().index.remove(&id);
    }

    /// Number of identifiers currently outstanding
    pub fn outstanding(&self) -> usize {
        self.inner.lock().index.len()
    }
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;

    fn pending() -> PendingAck {
        PendingAck::Unsubscribe(Token::new())
    }

    #[test]
    fn test_ids_distinct_and_nonzero() {
        let registry = IdRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = registry.allocate(pending()).unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id), "id {} issued twice", id);
        }
        assert_eq!(registry.outstanding(), 1000);
    }

    #[test]
    fn test_sweep_skips_outstanding() {
        let registry = IdRegistry::new();
        let first = registry.allocate(pending()).unwrap();
        let second = registry.allocate(pending()).unwrap();
        registry.free(first);

        // Sweeping forward from the last allocation, not reusing `second`
        let third = registry.allocate(pending()).unwrap();
        assert_ne!(third, second);
    }

    #[test]
    fn test_free_is_idempotent() {
        let registry = IdRegistry::new();
        let id = registry.allocate(pending()).unwrap();
        registry.free(id);
        registry.free(id);
        registry.free(40000);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_wraps_around_without_issuing_zero() {
        let registry = IdRegistry::new();
        {
            let mut inner = registry.inner.lock();
            inner.last_issued = u16::MAX;
        }
        let id = registry.allocate(pending()).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_exhaustion_returns_error() {
        let registry = IdRegistry::new();
        for _ in 0..u16::MAX {
            registry.allocate(pending()).unwrap();
        }
        assert!(matches!(
            registry.allocate(pending()),
            Err(ClientError::NoIdsAvailable)
        ));

        registry.free(123);
        assert!(registry.allocate(pending()).is_ok());
    }

    #[test]
    fn test_lookup_is_non_mutating() {
        let registry = IdRegistry::new();
        let id = registry.allocate(pending()).unwrap();
        assert!(registry.lookup(id).is_some());
        assert!(registry.lookup(id).is_some());
        assert!(registry.lookup(id.wrapping_add(1)).is_none());
    }
}
