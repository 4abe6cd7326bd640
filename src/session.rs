//! Record store.
//!
//! A [`Session`] carries one caller's security context and an identity map,
//! so repeated fetches of the same row hand back the same [`RecordHandle`].
//! Every statement it issues embeds the caller's read or write predicate, and
//! every returned row passes the matching in-memory check before it is used.

use crate::access::{AccessMarkers, can_read, can_write};
use crate::cache::Cache;
use crate::criteria::{self, Access, Page, Projection, SearchCriteria, SearchOptions};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gateway::{Connection, Row, Statement, Value};
use crate::geo::{Candidate, GeoPoint, LocationSearch, refine};
use crate::identity::{SecurityContext, parse_delegated_ids};
use crate::predicate::{Fragment, build_read, build_write};
use crate::record::{Context, Record, RecordHandle};
use crate::types::{RecordId, SecurityId, TEMPLATE_ROW_ID, Table};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

const MARKER_COLUMNS: &str = "id, read_security_id, write_security_id, latitude, longitude";

/// Result of [`Session::fetch_many`], shaped by [`Projection`].
#[derive(Clone, Debug)]
pub enum SearchResults {
    Records(Vec<RecordHandle>),
    Ids(Vec<RecordId>),
    Count(usize),
}

impl SearchResults {
    /// Number of matching rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Records(records) => records.len(),
            Self::Ids(ids) => ids.len(),
            Self::Count(count) => *count,
        }
    }

    /// Returns true when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record handles. Empty for the other projections.
    pub fn into_records(self) -> Vec<RecordHandle> {
        match self {
            Self::Records(records) => records,
            Self::Ids(_) | Self::Count(_) => Vec::new(),
        }
    }

    /// Matching ids. Empty for a count.
    pub fn into_ids(self) -> Vec<RecordId> {
        match self {
            Self::Records(records) => records.iter().filter_map(RecordHandle::id).collect(),
            Self::Ids(ids) => ids,
            Self::Count(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Intent {
    Write,
    Delete,
}

fn by_id(id: RecordId) -> Fragment {
    Fragment::new("id = ?", vec![Value::Integer(id.get())])
}

fn not_template() -> Fragment {
    Fragment::new("id <> ?", vec![Value::Integer(TEMPLATE_ROW_ID)])
}

fn select(table: Table, columns: &str, filter: Fragment, suffix: &str) -> Statement {
    let sql = format!("SELECT {columns} FROM {table} WHERE {} {suffix}", filter.sql);
    Statement::new(sql.trim_end(), filter.params)
}

fn markers(table: Table, row: &Row) -> AccessMarkers {
    AccessMarkers {
        table,
        id: row.get_i64("id"),
        read: row.get_i64("read_security_id").map(SecurityId::new),
        write: row.get_i64("write_security_id").map(SecurityId::new),
    }
}

/// Next `last_modified` value: now, but always after `previous`.
fn timestamp_after(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let micros = previous.map_or(now, |previous| now.max(previous.timestamp_micros() + 1));
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

fn page_bounds(page: Page) -> (i64, i64) {
    let limit = i64::try_from(page.size).unwrap_or(i64::MAX);
    let offset = i64::try_from(page.size.saturating_mul(page.index)).unwrap_or(i64::MAX);
    (limit, offset)
}

/// One caller's view of the store.
///
/// Sessions are cheap and meant to live for a single request. The identity
/// map is never shared between sessions.
pub struct Session<'e, C, K> {
    engine: &'e Engine<C, K>,
    context: SecurityContext,
    identity_map: HashMap<(Table, RecordId), RecordHandle>,
}

impl<'e, C, K> Session<'e, C, K> {
    pub(crate) fn new(engine: &'e Engine<C, K>, context: SecurityContext) -> Self {
        Self {
            engine,
            context,
            identity_map: HashMap::new(),
        }
    }

    /// The caller this session acts for.
    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    /// Returns the mapped instance for a row, if this session has loaded it.
    pub fn cached(&self, table: Table, id: RecordId) -> Option<RecordHandle> {
        self.identity_map.get(&(table, id)).cloned()
    }

    /// Forgets every mapped instance.
    pub fn clear(&mut self) {
        self.identity_map.clear();
    }

    fn predicate(&self, table: Table, access: Access) -> Fragment {
        match access {
            Access::Read => build_read(table, &self.context),
            Access::Write => build_write(table, &self.context),
        }
    }

    fn permits(&self, markers: &AccessMarkers, access: Access) -> bool {
        match access {
            Access::Read => can_read(&self.context, markers),
            Access::Write => can_write(&self.context, markers),
        }
    }

    fn may_assign(&self, value: Option<SecurityId>) -> bool {
        let Some(value) = value else {
            return true;
        };
        self.context.is_god()
            || value == SecurityId::OPEN
            || value == SecurityId::AUTHENTICATED
            || self.context.identities().contains(value)
    }

    fn may_delegate(&self, added: &BTreeSet<SecurityId>) -> bool {
        self.context.is_god() || self.context.identities().covers(added)
    }

    /// Maps a freshly decoded record, refreshing an existing instance in place.
    fn instantiate(&mut self, table: Table, record: Record) -> RecordHandle {
        let Some(id) = record.id() else {
            return RecordHandle::new(record);
        };
        if let Some(handle) = self.identity_map.get(&(table, id)) {
            handle.replace(record);
            return handle.clone();
        }
        let handle = RecordHandle::new(record);
        self.identity_map.insert((table, id), handle.clone());
        handle
    }

    fn remember(&mut self, table: Table, id: RecordId, handle: &RecordHandle) {
        match self.identity_map.get(&(table, id)) {
            Some(mapped) if mapped.ptr_eq(handle) => {}
            Some(mapped) => mapped.replace(handle.snapshot()),
            None => {
                self.identity_map.insert((table, id), handle.clone());
            }
        }
    }

    fn forget(&mut self, table: Table, id: RecordId) {
        if let Some(handle) = self.identity_map.remove(&(table, id)) {
            handle.update(|record| record.id = None);
        }
    }
}

impl<C, K> Session<'_, C, K>
where
    C: Connection,
    K: Cache,
{
    async fn exists(&self, table: Table, id: i64) -> Result<bool> {
        let statement = Statement::new(
            format!("SELECT id FROM {table} WHERE id = ?"),
            vec![Value::Integer(id)],
        );
        Ok(!self.engine.gateway.query(&statement).await?.is_empty())
    }

    /// Ids from `ids` that still exist, whoever can see them.
    pub(crate) async fn existing_ids(
        &self,
        table: Table,
        ids: &[RecordId],
    ) -> Result<HashSet<RecordId>> {
        let filter = Fragment::in_list("id", ids.iter().map(|id| Value::Integer(id.get())));
        let rows = self
            .engine
            .gateway
            .query(&select(table, "id", filter, ""))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_i64("id"))
            .filter_map(|id| RecordId::new(id).ok())
            .collect())
    }

    /// Child lists of the collections among `ids`, whoever can see them.
    ///
    /// Ids that are missing, not collections or undecodable map to nothing.
    pub(crate) async fn child_lists(
        &self,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Vec<RecordId>>> {
        let filter = Fragment::in_list("id", ids.iter().map(|id| Value::Integer(id.get())));
        let rows = self
            .engine
            .gateway
            .query(&select(Table::Records, "id, context", filter, ""))
            .await?;
        let mut lists = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.get_i64("id").and_then(|id| RecordId::new(id).ok()) else {
                continue;
            };
            match Context::decode(row.get_str("context")) {
                Ok(context) if !context.children.is_empty() => {
                    lists.insert(id, context.children);
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(id = %id, %error, "unreadable child list"),
            }
        }
        Ok(lists)
    }

    /// Removes a row whose insert could not be completed.
    async fn discard_insert(&self, table: Table, id: RecordId) {
        let statement = Statement::new(
            format!("DELETE FROM {table} WHERE id = ?"),
            vec![Value::Integer(id.get())],
        );
        if let Err(error) = self.engine.gateway.execute(&statement).await {
            tracing::warn!(table = %table, id = %id, %error, "could not discard partial insert");
        }
    }

    /// The row as the caller may modify it, or `None` when it is out of reach.
    pub(crate) async fn writable_row(&self, table: Table, id: RecordId) -> Result<Option<Row>> {
        let filter = Fragment::all([by_id(id), self.predicate(table, Access::Write)]);
        let rows = self
            .engine
            .gateway
            .query(&select(table, "*", filter, "LIMIT 1"))
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .filter(|row| self.permits(&markers(table, row), Access::Write)))
    }

    /// Error for a row the write predicate hid: illegal when it exists.
    pub(crate) async fn refusal(&self, table: Table, id: RecordId, intent: Intent) -> Error {
        match self.exists(table, id.get()).await {
            Ok(true) => {
                tracing::warn!(
                    table = %table,
                    id = %id,
                    principal = ?self.context.principal(),
                    ?intent,
                    "illegal attempt"
                );
                match intent {
                    Intent::Write => Error::IllegalWriteAttempt { table, id },
                    Intent::Delete => Error::IllegalDeleteAttempt { table, id },
                }
            }
            Ok(false) => Error::NotFound { table, id },
            Err(error) => error,
        }
    }

    /// Fetches one row the caller can read, or write when `access` says so.
    ///
    /// Rows hidden by the predicate, and template rows, come back as `None`.
    pub async fn fetch_by_id(
        &mut self,
        table: Table,
        id: RecordId,
        access: Access,
    ) -> Result<Option<RecordHandle>> {
        if id.get() == TEMPLATE_ROW_ID {
            return Ok(None);
        }
        let filter = Fragment::all([by_id(id), self.predicate(table, access)]);
        let rows = self
            .engine
            .gateway
            .query(&select(table, "*", filter, "LIMIT 1"))
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        if !self.permits(&markers(table, &row), access) {
            tracing::warn!(table = %table, id = %id, "row rejected by in-memory gate");
            return Ok(None);
        }
        let record = self.engine.registry.decode(table, &row)?;
        Ok(Some(self.instantiate(table, record)))
    }

    /// Runs a search under the caller's predicate.
    ///
    /// Results are ordered by id, or by exact distance then id for location
    /// searches. Rows whose discriminator cannot be resolved are skipped.
    pub async fn fetch_many(
        &mut self,
        table: Table,
        criteria: &SearchCriteria,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let engine = self.engine;
        let mut parts = vec![
            not_template(),
            self.predicate(table, options.access),
            criteria.to_fragment(options.mode),
        ];
        if let Some(location) = &criteria.location {
            parts.push(criteria::location_fragment(location, engine.search_inflation));
        }
        let filter = Fragment::all(parts);
        let columns = match options.projection {
            Projection::Records => "*",
            Projection::Ids | Projection::Count => MARKER_COLUMNS,
        };
        let page = options
            .page
            .filter(|_| options.projection != Projection::Count);

        let statement = match (&criteria.location, page) {
            (Some(location), _) => {
                // The distance column's parameters precede the filter's.
                let mut params = vec![
                    Value::Real(location.center.latitude()),
                    Value::Real(location.center.longitude()),
                ];
                params.extend(filter.params);
                Statement::new(
                    format!(
                        "SELECT {columns}, {} AS coarse_km FROM {table} \
                         WHERE {} ORDER BY coarse_km, id",
                        criteria::distance_expression(),
                        filter.sql
                    ),
                    params,
                )
            }
            (None, Some(page)) => {
                let (limit, offset) = page_bounds(page);
                let mut statement = select(table, columns, filter, "ORDER BY id LIMIT ? OFFSET ?");
                statement.params.extend([Value::Integer(limit), Value::Integer(offset)]);
                statement
            }
            (None, None) => select(table, columns, filter, "ORDER BY id"),
        };

        let rows = engine.gateway.query(&statement).await?;
        let fetched = rows.len();
        let mut rows: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.permits(&markers(table, row), options.access))
            .collect();
        if rows.len() < fetched {
            tracing::warn!(
                table = %table,
                discarded = fetched - rows.len(),
                "rows rejected by in-memory gate"
            );
        }
        if let Some(location) = &criteria.location {
            rows = self.refine_located(rows, location, page);
        }

        Ok(match options.projection {
            Projection::Count => SearchResults::Count(rows.len()),
            Projection::Ids => SearchResults::Ids(
                rows.iter()
                    .filter_map(|row| row.get_i64("id"))
                    .filter_map(|id| RecordId::new(id).ok())
                    .collect(),
            ),
            Projection::Records => {
                let mut handles = Vec::with_capacity(rows.len());
                for row in rows {
                    match engine.registry.decode(table, &row) {
                        Ok(record) => handles.push(self.instantiate(table, record)),
                        Err(error) => {
                            tracing::warn!(
                                table = %table,
                                id = ?row.get_i64("id"),
                                error = %error,
                                "skipping undecodable row"
                            );
                        }
                    }
                }
                SearchResults::Records(handles)
            }
        })
    }

    fn refine_located(
        &self,
        rows: Vec<Row>,
        location: &LocationSearch,
        page: Option<Page>,
    ) -> Vec<Row> {
        let candidates = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get_i64("id")?;
                let point =
                    GeoPoint::new(row.get_f64("latitude")?, row.get_f64("longitude")?).ok()?;
                let coarse_km = row.get_f64("coarse_km")?;
                Some(Candidate {
                    item: row,
                    id,
                    point,
                    coarse_km,
                })
            })
            .collect();
        let refined = refine(candidates, location, self.engine.max_geodesic_iterations)
            .into_iter()
            .map(|(row, _)| row);
        match page {
            Some(page) => refined
                .skip(page.size.saturating_mul(page.index))
                .take(page.size)
                .collect(),
            None => refined.collect(),
        }
    }

    /// Persists a record: inserts when it has no id, updates otherwise.
    ///
    /// On success the handle carries the id, the effective permission columns
    /// and the new `last_modified`.
    pub async fn write(&mut self, handle: &RecordHandle) -> Result<RecordId> {
        let record = handle.snapshot();
        match record.id() {
            None => self.insert(handle, record).await,
            Some(id) => self.update(handle, record, id).await,
        }
    }

    /// Inserts a new record and returns its mapped handle.
    pub async fn create(&mut self, record: Record) -> Result<RecordHandle> {
        let handle = RecordHandle::new(record);
        self.write(&handle).await?;
        Ok(handle)
    }

    async fn insert(&mut self, handle: &RecordHandle, mut record: Record) -> Result<RecordId> {
        let table = record.table();
        let Some(principal) = self
            .context
            .principal()
            .filter(|_| self.context.is_authenticated())
        else {
            tracing::warn!(table = %table, "anonymous insert refused");
            return Err(Error::NotAuthorized { table, id: None });
        };
        if !self.exists(table, TEMPLATE_ROW_ID).await? {
            return Err(Error::MissingTemplate { table });
        }

        let is_node = match record.security_node() {
            Some(node) if !self.may_delegate(&node.delegated_ids) => {
                tracing::warn!(
                    table = %table,
                    principal = %principal,
                    "delegation of unheld ids refused"
                );
                return Err(Error::NotAuthorized { table, id: None });
            }
            Some(_) => true,
            None => false,
        };
        if is_node {
            // Readable by itself once the id is known.
            record.write_security_id = Some(SecurityId::SELF_WRITE);
            record.read_security_id = Some(SecurityId::LOCKED);
        } else {
            let write = *record
                .write_security_id
                .get_or_insert(SecurityId::from(principal));
            let read = *record.read_security_id.get_or_insert(SecurityId::OPEN);
            if !self.may_assign(Some(read)) || !self.may_assign(Some(write)) {
                tracing::warn!(
                    table = %table,
                    principal = %principal,
                    "unassignable security id refused"
                );
                return Err(Error::NotAuthorized { table, id: None });
            }
        }

        let modified = timestamp_after(None);
        let mut columns = record.to_columns()?;
        columns.push(("last_modified", Value::Integer(modified.timestamp_micros())));
        let names: Vec<&str> = columns.iter().map(|(column, _)| *column).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let statement = Statement::new(
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders})",
                names.join(", ")
            ),
            columns.into_iter().map(|(_, value)| value).collect(),
        );

        let executed = self.engine.gateway.execute(&statement).await?;
        let id = executed
            .last_insert_id
            .ok_or_else(|| Error::Connection(format!("{table} insert returned no id").into()))
            .and_then(RecordId::new)?;

        if is_node {
            let own = SecurityId::from(id);
            let finished = self
                .engine
                .gateway
                .execute(&Statement::new(
                    format!("UPDATE {table} SET read_security_id = ? WHERE id = ?"),
                    vec![Value::Integer(own.get()), Value::Integer(id.get())],
                ))
                .await;
            if let Err(error) = finished {
                self.discard_insert(table, id).await;
                return Err(error);
            }
            record.read_security_id = Some(own);
            self.engine.invalidate_identities(id).await;
        }

        handle.update(|current| {
            current.id = Some(id);
            current.read_security_id = record.read_security_id;
            current.write_security_id = record.write_security_id;
            current.last_modified = Some(modified);
        });
        self.remember(table, id, handle);
        tracing::debug!(table = %table, id = %id, principal = %principal, "record inserted");
        Ok(id)
    }

    async fn update(
        &mut self,
        handle: &RecordHandle,
        mut record: Record,
        id: RecordId,
    ) -> Result<RecordId> {
        let table = record.table();
        let Some(stored) = self.writable_row(table, id).await? else {
            return Err(self.refusal(table, id, Intent::Write).await);
        };
        let stored_read = stored.get_i64("read_security_id").map(SecurityId::new);
        let stored_write = stored.get_i64("write_security_id").map(SecurityId::new);
        let stored_modified = stored
            .get_i64("last_modified")
            .and_then(DateTime::<Utc>::from_timestamp_micros);
        let locked = stored_read == Some(SecurityId::LOCKED);

        if let Some(node) = record.security_node() {
            let held = stored
                .get_str("delegated_ids")
                .map(parse_delegated_ids)
                .unwrap_or_default();
            let added: BTreeSet<SecurityId> =
                node.delegated_ids.difference(&held).copied().collect();
            if !self.may_delegate(&added) {
                tracing::warn!(table = %table, id = %id, "delegation of unheld ids refused");
                return Err(Error::NotAuthorized { table, id: Some(id) });
            }
            record.write_security_id = Some(SecurityId::SELF_WRITE);
            record.read_security_id = Some(if locked {
                SecurityId::LOCKED
            } else {
                SecurityId::from(id)
            });
        } else {
            // The lock marker only changes through lock and unlock.
            if locked {
                record.read_security_id = stored_read;
            }
            let changed = [
                (record.read_security_id, stored_read),
                (record.write_security_id, stored_write),
            ];
            if changed
                .into_iter()
                .any(|(value, previous)| value != previous && !self.may_assign(value))
            {
                tracing::warn!(table = %table, id = %id, "unassignable security id refused");
                return Err(Error::NotAuthorized { table, id: Some(id) });
            }
        }

        let modified = timestamp_after(stored_modified);
        let mut columns = record.to_columns()?;
        columns.push(("last_modified", Value::Integer(modified.timestamp_micros())));
        let assignments = columns
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let guard = Fragment::all([by_id(id), self.predicate(table, Access::Write)]);
        let mut params: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
        params.extend(guard.params);
        let executed = self
            .engine
            .gateway
            .execute(&Statement::new(
                format!("UPDATE {table} SET {assignments} WHERE {}", guard.sql),
                params,
            ))
            .await?;
        if executed.rows_affected == 0 {
            return Err(self.refusal(table, id, Intent::Write).await);
        }

        handle.update(|current| {
            current.read_security_id = record.read_security_id;
            current.write_security_id = record.write_security_id;
            current.last_modified = Some(modified);
        });
        self.remember(table, id, handle);
        if table == Table::SecurityNodes {
            self.engine.invalidate_identities(id).await;
        }
        tracing::debug!(table = %table, id = %id, "record updated");
        Ok(id)
    }

    /// Deletes a record and clears the handle's id.
    pub async fn delete(&mut self, handle: &RecordHandle) -> Result<()> {
        let (table, id) = {
            let record = handle.read();
            (record.table(), record.id())
        };
        let Some(id) = id else {
            return Err(Error::InvalidId(format!("{table} record was never written")));
        };
        self.delete_by_id(table, id).await?;
        handle.update(|record| record.id = None);
        Ok(())
    }

    /// Deletes a row by id.
    ///
    /// The row must be writable by the caller. Template rows and the
    /// superuser's security node can never be deleted.
    pub async fn delete_by_id(&mut self, table: Table, id: RecordId) -> Result<()> {
        let protected = id.get() == TEMPLATE_ROW_ID
            || (table == Table::SecurityNodes && id == self.engine.god_id);
        if protected {
            tracing::warn!(table = %table, id = %id, "delete of protected row refused");
            return Err(Error::IllegalDeleteAttempt { table, id });
        }
        if self.writable_row(table, id).await?.is_none() {
            return Err(self.refusal(table, id, Intent::Delete).await);
        }

        let guard = Fragment::all([by_id(id), self.predicate(table, Access::Write)]);
        self.engine
            .gateway
            .execute(&Statement::new(
                format!("DELETE FROM {table} WHERE {}", guard.sql),
                guard.params,
            ))
            .await?;
        if self.exists(table, id.get()).await? {
            tracing::warn!(table = %table, id = %id, "row survived delete");
            return Err(Error::FailedDeleteAttempt { table, id });
        }

        self.forget(table, id);
        if table == Table::SecurityNodes {
            self.engine.invalidate_identities(id).await;
        }
        tracing::debug!(table = %table, id = %id, "record deleted");
        Ok(())
    }

    /// Hides a row from everyone without write access.
    ///
    /// Returns the read id the row had before, or [`SecurityId::OPEN`] when
    /// the lock could not be applied for any reason.
    pub async fn lock(&mut self, table: Table, id: RecordId) -> SecurityId {
        match self.try_lock(table, id).await {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                tracing::warn!(table = %table, id = %id, "lock refused");
                SecurityId::OPEN
            }
            Err(error) => {
                tracing::warn!(table = %table, id = %id, error = %error, "lock failed");
                SecurityId::OPEN
            }
        }
    }

    async fn try_lock(&mut self, table: Table, id: RecordId) -> Result<Option<SecurityId>> {
        if id.get() == TEMPLATE_ROW_ID {
            return Ok(None);
        }
        let Some(row) = self.writable_row(table, id).await? else {
            return Ok(None);
        };
        let previous = row.get_i64("read_security_id").map(SecurityId::new);

        // Only swap in the marker if nobody changed the column meanwhile.
        let guard = Fragment::all([
            by_id(id),
            Fragment::new(
                "read_security_id IS ?",
                vec![Value::from(previous.map(SecurityId::get))],
            ),
            self.predicate(table, Access::Write),
        ]);
        let mut params = vec![
            Value::Integer(SecurityId::LOCKED.get()),
            Value::Integer(Utc::now().timestamp_micros()),
        ];
        params.extend(guard.params);
        let executed = self
            .engine
            .gateway
            .execute(&Statement::new(
                format!(
                    "UPDATE {table} SET read_security_id = ?, \
                     last_modified = MAX(COALESCE(last_modified, 0) + 1, ?) WHERE {}",
                    guard.sql
                ),
                params,
            ))
            .await?;
        if executed.rows_affected == 0 {
            return Ok(None);
        }

        if let Some(handle) = self.identity_map.get(&(table, id)) {
            handle.update(|record| record.read_security_id = Some(SecurityId::LOCKED));
        }
        tracing::debug!(table = %table, id = %id, ?previous, "record locked");
        Ok(Some(previous.unwrap_or(SecurityId::OPEN)))
    }

    /// Restores the read id a [`Session::lock`] call returned.
    ///
    /// Unlocking a row that is not locked does nothing. Security nodes always
    /// return to reading as themselves.
    pub async fn unlock(&mut self, table: Table, id: RecordId, previous: SecurityId) -> Result<()> {
        let Some(row) = self.writable_row(table, id).await? else {
            return Err(self.refusal(table, id, Intent::Write).await);
        };
        if row.get_i64("read_security_id") != Some(SecurityId::LOCKED.get()) {
            return Ok(());
        }
        let restored = match table {
            Table::SecurityNodes => SecurityId::from(id),
            Table::Records => previous,
        };
        if table == Table::Records && !self.may_assign(Some(restored)) {
            tracing::warn!(table = %table, id = %id, "unassignable security id refused");
            return Err(Error::NotAuthorized { table, id: Some(id) });
        }

        let guard = Fragment::all([
            by_id(id),
            Fragment::new(
                "read_security_id = ?",
                vec![Value::Integer(SecurityId::LOCKED.get())],
            ),
            self.predicate(table, Access::Write),
        ]);
        let mut params = vec![
            Value::Integer(restored.get()),
            Value::Integer(Utc::now().timestamp_micros()),
        ];
        params.extend(guard.params);
        let executed = self
            .engine
            .gateway
            .execute(&Statement::new(
                format!(
                    "UPDATE {table} SET read_security_id = ?, \
                     last_modified = MAX(COALESCE(last_modified, 0) + 1, ?) WHERE {}",
                    guard.sql
                ),
                params,
            ))
            .await?;
        if executed.rows_affected == 0 {
            return Err(self.refusal(table, id, Intent::Write).await);
        }

        if let Some(handle) = self.identity_map.get(&(table, id)) {
            handle.update(|record| record.read_security_id = Some(restored));
        }
        tracing::debug!(table = %table, id = %id, restored = %restored, "record unlocked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_should_always_advance() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        let next = timestamp_after(Some(future));
        assert_eq!(next.timestamp_micros(), future.timestamp_micros() + 1);
        assert!(timestamp_after(None) <= Utc::now());
    }

    #[test]
    fn page_bounds_should_saturate() {
        assert_eq!(page_bounds(Page { size: 10, index: 2 }), (10, 20));
        let (_, offset) = page_bounds(Page {
            size: usize::MAX,
            index: 2,
        });
        assert_eq!(offset, i64::MAX);
    }

    #[test]
    fn select_should_keep_parameters_in_order() {
        let statement = select(
            Table::Records,
            "id",
            Fragment::all([by_id(RecordId::new(5).unwrap()), not_template()]),
            "",
        );
        assert_eq!(statement.sql, "SELECT id FROM records WHERE (id = ?) AND (id <> ?)");
        assert_eq!(statement.params, vec![Value::Integer(5), Value::Integer(1)]);
    }

    #[test]
    fn search_results_should_expose_ids() {
        let ids = vec![RecordId::new(3).unwrap()];
        assert_eq!(SearchResults::Ids(ids.clone()).into_ids(), ids);
        assert!(SearchResults::Count(0).is_empty());
        assert!(SearchResults::Count(4).into_records().is_empty());
    }
}
