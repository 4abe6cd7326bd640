use crate::cache::Cache;
use crate::identity::IdentitySet;
use crate::types::RecordId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// In-process LRU cache for resolved identity sets, with optional TTL.
///
/// A short TTL bounds how long a revoked delegation stays effective when the
/// revocation happened through another process.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    state: Arc<Mutex<Lru>>,
    capacity: usize,
    ttl: Option<Duration>,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<RecordId, Slot>,
    // Last-use tick to principal; the first key is the eviction candidate.
    recency: BTreeMap<u64, RecordId>,
    clock: u64,
}

#[derive(Debug)]
struct Slot {
    identities: IdentitySet,
    stored_at: Instant,
    tick: u64,
}

impl Lru {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, principal: RecordId) {
        if let Some(slot) = self.entries.remove(&principal) {
            self.recency.remove(&slot.tick);
        }
    }

    fn touch(&mut self, principal: RecordId) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(&principal) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, principal);
        }
    }

    fn shrink_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` principals.
    ///
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(Lru::default())),
            capacity,
            ttl: None,
        }
    }

    /// Expires entries `ttl` after they were stored.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Number of principals currently cached, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().expect("poisoned lock").entries.len()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, slot: &Slot, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(slot.stored_at) > ttl)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_identities(&self, principal: RecordId) -> Option<IdentitySet> {
        if self.capacity == 0 {
            return None;
        }
        let mut lru = self.state.lock().expect("poisoned lock");
        let slot = lru.entries.get(&principal)?;
        if self.expired(slot, Instant::now()) {
            lru.remove(principal);
            return None;
        }
        let identities = slot.identities.clone();
        lru.touch(principal);
        Some(identities)
    }

    async fn set_identities(&self, principal: RecordId, identities: IdentitySet) {
        if self.capacity == 0 {
            return;
        }
        let mut lru = self.state.lock().expect("poisoned lock");
        lru.remove(principal);
        let tick = lru.next_tick();
        lru.entries.insert(
            principal,
            Slot {
                identities,
                stored_at: Instant::now(),
                tick,
            },
        );
        lru.recency.insert(tick, principal);
        lru.shrink_to(self.capacity);
    }

    async fn invalidate_principal(&self, principal: RecordId) {
        self.state.lock().expect("poisoned lock").remove(principal);
    }

    async fn invalidate_all(&self) {
        *self.state.lock().expect("poisoned lock") = Lru::default();
    }
}
