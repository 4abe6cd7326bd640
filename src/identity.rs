use crate::gateway::{Connection, Gateway, Statement, Value};
use crate::types::{RecordId, SecurityId, Table};
use std::collections::BTreeSet;

/// Deduplicated, sorted set of positive security ids a principal may act as.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentitySet(BTreeSet<SecurityId>);

impl IdentitySet {
    /// Creates an empty (unauthenticated) set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a set, dropping reserved markers and non-positive values.
    pub fn from_ids(ids: impl IntoIterator<Item = SecurityId>) -> Self {
        Self(ids.into_iter().filter(|id| id.is_token()).collect())
    }

    /// Returns true when the set holds `id`.
    pub fn contains(&self, id: SecurityId) -> bool {
        self.0.contains(&id)
    }

    /// Returns true when the set holds no ids.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SecurityId> + '_ {
        self.0.iter().copied()
    }

    /// Returns true when every id in `other` is also in this set.
    pub fn covers(&self, other: &BTreeSet<SecurityId>) -> bool {
        other.iter().all(|id| !id.is_token() || self.0.contains(id))
    }
}

/// Who is making the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityContext {
    principal: Option<RecordId>,
    identities: IdentitySet,
    god: bool,
    god_id: RecordId,
}

impl SecurityContext {
    /// Context for a request without a login.
    pub fn anonymous(god_id: RecordId) -> Self {
        Self {
            principal: None,
            identities: IdentitySet::empty(),
            god: false,
            god_id,
        }
    }

    /// Context for a resolved principal.
    pub fn authenticated(principal: RecordId, identities: IdentitySet, god_id: RecordId) -> Self {
        Self {
            principal: Some(principal),
            identities,
            god: principal == god_id,
            god_id,
        }
    }

    /// The principal's own id.
    pub fn principal(&self) -> Option<RecordId> {
        self.principal
    }

    /// The effective identity set.
    pub fn identities(&self) -> &IdentitySet {
        &self.identities
    }

    /// Returns true for the superuser.
    pub fn is_god(&self) -> bool {
        self.god
    }

    /// The reserved superuser id this context was built against.
    pub fn god_id(&self) -> RecordId {
        self.god_id
    }

    /// Authenticated means holding at least one identity.
    pub fn is_authenticated(&self) -> bool {
        !self.identities.is_empty()
    }
}

/// Parses the stored comma-separated delegated id list.
///
/// Unparseable entries are skipped so a damaged list only ever grants less.
pub(crate) fn parse_delegated_ids(raw: &str) -> BTreeSet<SecurityId> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .map(SecurityId::new)
        .filter(|id| id.is_token())
        .collect()
}

/// Serializes a delegated id list for storage.
pub(crate) fn format_delegated_ids(ids: &BTreeSet<SecurityId>) -> String {
    ids.iter()
        .map(|id| id.get().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Outcome of an identity lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Read from the principal's security node.
    Found(IdentitySet),
    /// Fallback to `{principal}` after a missing node or a failed lookup.
    Degraded(IdentitySet),
}

impl Resolution {
    pub(crate) fn is_authoritative(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub(crate) fn into_identities(self) -> IdentitySet {
        match self {
            Self::Found(identities) | Self::Degraded(identities) => identities,
        }
    }
}

/// Resolves a principal's effective identity set.
///
/// This lookup runs without a security predicate because predicates are built
/// from its result, so it must only ever be called for the principal making
/// the request. Any failure degrades to `{principal}`.
pub(crate) async fn resolve<C: Connection>(
    gateway: &Gateway<C>,
    principal: RecordId,
) -> Resolution {
    let statement = Statement::new(
        format!(
            "SELECT delegated_ids FROM {} WHERE id = ?",
            Table::SecurityNodes.name()
        ),
        vec![Value::Integer(principal.get())],
    );

    let own = SecurityId::from(principal);
    let degraded = || Resolution::Degraded(IdentitySet::from_ids([own]));
    match gateway.query(&statement).await {
        Ok(rows) => match rows.first() {
            Some(row) => {
                let delegated = row
                    .get_str("delegated_ids")
                    .map(parse_delegated_ids)
                    .unwrap_or_default();
                Resolution::Found(IdentitySet::from_ids(
                    std::iter::once(own).chain(delegated),
                ))
            }
            None => {
                tracing::warn!(principal = %principal, "principal has no security node");
                degraded()
            }
        },
        Err(error) => {
            tracing::warn!(principal = %principal, error = %error, "identity lookup failed");
            degraded()
        }
    }
}
