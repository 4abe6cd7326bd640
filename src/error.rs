use crate::types::{RecordId, Table};
use thiserror::Error;

/// Gateway-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Authorization failures are ordinary variants; nothing in the crate panics
/// on a denied request.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection or statement failure. The statement was rolled back.
    #[error("connection failure: {0}")]
    Connection(#[source] StoreError),
    /// The caller lacks the permission the operation requires.
    #[error("not authorized to access {table} row {id:?}")]
    NotAuthorized { table: Table, id: Option<RecordId> },
    /// No row with this id exists, or it is not visible.
    #[error("{table} row {id} not found")]
    NotFound { table: Table, id: RecordId },
    /// Write aimed at a row that exists but is invisible under the write predicate.
    #[error("illegal write attempt on {table} row {id}")]
    IllegalWriteAttempt { table: Table, id: RecordId },
    /// Delete aimed at a row the caller cannot write.
    #[error("illegal delete attempt on {table} row {id}")]
    IllegalDeleteAttempt { table: Table, id: RecordId },
    /// The row was still present after the delete statement ran.
    #[error("failed to delete {table} row {id}")]
    FailedDeleteAttempt { table: Table, id: RecordId },
    /// The discriminator maps to no known variant and no fallback applies.
    #[error("unresolved record type `{discriminator}` in {table}")]
    RecordTypeUnresolved { table: Table, discriminator: String },
    /// The table has no template row, so inserts are refused.
    #[error("{table} has no template row")]
    MissingTemplate { table: Table },
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid search criteria or options.
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),
    /// A stored column could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// Collection operation on a record that is not a collection.
    #[error("record {id} is not a collection")]
    NotACollection { id: RecordId },
    /// The child is already in the collection.
    #[error("record {child} is already a child of collection {collection}")]
    DuplicateChild { collection: RecordId, child: RecordId },
    /// Inserting the child would make the collection its own descendant.
    #[error("inserting {child} into collection {collection} would create a cycle")]
    CollectionCycle { collection: RecordId, child: RecordId },
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Connection(error)
    }
}

impl Error {
    /// Returns true for failures caused by the caller's permissions.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized { .. }
                | Self::IllegalWriteAttempt { .. }
                | Self::IllegalDeleteAttempt { .. }
        )
    }
}
