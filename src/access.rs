//! In-memory access checks.
//!
//! These mirror the SQL predicates in [`crate::predicate`] and act as the
//! final gate on every row a fetch returns.

use crate::identity::SecurityContext;
use crate::types::{SecurityId, Table};

/// Permission columns of one row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessMarkers {
    pub table: Table,
    pub id: Option<i64>,
    pub read: Option<SecurityId>,
    pub write: Option<SecurityId>,
}

impl AccessMarkers {
    fn is_god_row(&self, context: &SecurityContext) -> bool {
        self.table == Table::SecurityNodes && self.id == Some(context.god_id().get())
    }

    /// Whether the row carries the lock marker.
    pub fn is_locked(&self) -> bool {
        self.read == Some(SecurityId::LOCKED)
    }
}

/// Returns true when `context` may modify the row.
pub fn can_write(context: &SecurityContext, markers: &AccessMarkers) -> bool {
    if context.is_god() {
        return true;
    }
    if markers.is_god_row(context) || !context.is_authenticated() {
        return false;
    }
    match markers.write {
        None => true,
        Some(write) if write.is_open() => true,
        Some(SecurityId::SELF_WRITE) => markers
            .id
            .is_some_and(|id| context.identities().contains(SecurityId::new(id))),
        Some(write) => context.identities().contains(write),
    }
}

/// Returns true when `context` may see the row.
pub fn can_read(context: &SecurityContext, markers: &AccessMarkers) -> bool {
    if context.is_god() {
        return true;
    }
    if markers.is_god_row(context) {
        return false;
    }
    if markers.is_locked() {
        return can_write(context, markers);
    }
    match markers.read {
        None => return true,
        Some(read) if read.is_open() => return true,
        Some(SecurityId::AUTHENTICATED) if context.is_authenticated() => return true,
        Some(read) if context.identities().contains(read) => return true,
        _ => {}
    }
    can_write(context, markers)
}
