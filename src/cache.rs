use crate::identity::IdentitySet;
use crate::types::RecordId;
use async_trait::async_trait;

/// Cache interface for resolved identity sets.
///
/// Entries are keyed by the principal they were resolved for and hold nothing
/// but that principal's own effective identity set.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Gets the cached identity set for a principal.
    async fn get_identities(&self, principal: RecordId) -> Option<IdentitySet>;

    /// Sets the cached identity set for a principal.
    async fn set_identities(&self, principal: RecordId, identities: IdentitySet);

    /// Invalidates cache for a principal.
    async fn invalidate_principal(&self, principal: RecordId);

    /// Invalidates every entry.
    async fn invalidate_all(&self);
}

/// No-op cache implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get_identities(&self, _principal: RecordId) -> Option<IdentitySet> {
        None
    }

    async fn set_identities(&self, _principal: RecordId, _identities: IdentitySet) {}

    async fn invalidate_principal(&self, _principal: RecordId) {}

    async fn invalidate_all(&self) {}
}
