//! Row-level, multi-tenant access control over a relational store.
//!
//! Every stored row carries its own read and write security ids. Statements
//! issued through a [`Session`] embed a predicate built from the caller's
//! effective identity set, so rows the caller may not see are never
//! materialized, and every returned row is checked again in memory. Omissions
//! fail closed: an unresolvable identity reads only open rows and writes
//! nothing.
//!
//! # Examples
//!
//! Creating and fetching a record against an in-memory SQLite store (enable
//! `sqlite`, on by default):
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # futures::executor::block_on(async {
//! use rowguard::{Access, EngineBuilder, Record, RecordId, SqliteConnection, Table, VariantTag};
//!
//! let connection = SqliteConnection::open_in_memory()?;
//! connection.install_baseline(RecordId::new(2)?)?;
//! let engine = EngineBuilder::new(connection).build()?;
//!
//! let mut session = engine.session(Some(RecordId::new(2)?)).await;
//! let mut place = Record::new(VariantTag::Place);
//! place.name = Some("Town Hall".to_string());
//! let handle = session.create(place).await?;
//!
//! let id = handle.id().expect("written records have an id");
//! let fetched = session.fetch_by_id(Table::Records, id, Access::Read).await?;
//! assert!(fetched.is_some_and(|fetched| fetched.ptr_eq(&handle)));
//! # Ok::<(), rowguard::Error>(())
//! # }).unwrap();
//! ```
//!
//! Caching resolved identity sets across sessions (enable `memory-cache`):
//! ```no_run
//! # #[cfg(feature = "memory-cache")]
//! # {
//! use rowguard::MemoryCache;
//! use std::time::Duration;
//! let cache = MemoryCache::new(1024).with_ttl(Duration::from_secs(30));
//! # let _ = cache;
//! # }
//! ```
#![forbid(unsafe_code)]

mod access;
mod cache;
mod collection;
mod criteria;
mod engine;
mod error;
mod factory;
mod gateway;
mod geo;
mod identity;
mod predicate;
mod record;
mod session;
mod types;
#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use crate::access::{AccessMarkers, can_read, can_write};
pub use crate::cache::{Cache, NoCache};
pub use crate::collection::HierarchyNode;
pub use crate::criteria::{Access, Page, Projection, SearchCriteria, SearchMode, SearchOptions};
pub use crate::engine::{Engine, EngineBuilder, EngineConfig};
pub use crate::error::{Error, Result, StoreError};
pub use crate::factory::{VariantRegistry, VariantTag};
pub use crate::gateway::{Connection, Executed, Gateway, Row, Statement, Value};
pub use crate::geo::{
    BoundingBox, Candidate, DEFAULT_MAX_ITERATIONS, DEFAULT_SEARCH_INFLATION, EARTH_RADIUS_KM,
    GeoPoint, LocationSearch, bounding_box, haversine_km, refine, vincenty_km,
};
pub use crate::identity::{IdentitySet, SecurityContext};
pub use crate::predicate::{Fragment, build_read, build_write};
pub use crate::record::{
    AddressField, Context, NodeKind, Payload, Record, RecordHandle, SecurityNode, TAG_COUNT, Tags,
    Variant,
};
pub use crate::session::{SearchResults, Session};
pub use crate::types::{
    DEFAULT_GOD_ID, Discriminator, LoginId, RecordId, SecurityId, TEMPLATE_ROW_ID, Table,
};

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryCache;

#[cfg(feature = "sqlite")]
pub use crate::sqlite::SqliteConnection;
