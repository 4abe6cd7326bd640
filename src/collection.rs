//! Collection operations.
//!
//! A collection keeps the ordered ids of its children in its context. Changes
//! need write access on the collection only; children are fetched under the
//! caller's read predicate, so hidden children are skipped during traversal.
//! Cycle checks are the exception: they follow every stored child list.

use crate::cache::Cache;
use crate::criteria::{SearchCriteria, SearchOptions};
use crate::error::{Error, Result};
use crate::gateway::Connection;
use crate::record::RecordHandle;
use crate::session::{Intent, Session};
use crate::types::{Discriminator, RecordId, Table};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;

/// One node of a [`Session::hierarchy`] dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HierarchyNode {
    pub id: RecordId,
    pub discriminator: Discriminator,
    pub name: Option<String>,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    fn leaf(handle: &RecordHandle) -> Option<Self> {
        let record = handle.read();
        Some(Self {
            id: record.id()?,
            discriminator: record.discriminator().clone(),
            name: record.name.clone(),
            children: Vec::new(),
        })
    }
}

fn collection_id(handle: &RecordHandle) -> Result<RecordId> {
    let record = handle.read();
    let id = record
        .id()
        .ok_or_else(|| Error::InvalidId("collection was never written".to_string()))?;
    if !record.is_collection() {
        return Err(Error::NotACollection { id });
    }
    Ok(id)
}

fn child_ids_of(handle: &RecordHandle) -> Vec<RecordId> {
    let record = handle.read();
    if record.is_collection() {
        record.child_ids().to_vec()
    } else {
        Vec::new()
    }
}

/// Index range covered by `length` items starting at `index`.
///
/// A negative length counts backwards, `index` included. An index past the
/// end selects nothing.
fn child_range(len: usize, index: usize, length: isize) -> Range<usize> {
    if index >= len {
        return len..len;
    }
    if length >= 0 {
        index..index.saturating_add(length.unsigned_abs()).min(len)
    } else {
        let end = index + 1;
        end.saturating_sub(length.unsigned_abs())..end
    }
}

fn ids_criteria(ids: &[RecordId]) -> SearchCriteria {
    ids.iter()
        .fold(SearchCriteria::new(), |criteria, id| criteria.id(*id))
}

impl<C, K> Session<'_, C, K>
where
    C: Connection,
    K: Cache,
{
    /// Visible children in collection order.
    pub async fn children(&mut self, collection: &RecordHandle) -> Result<Vec<RecordHandle>> {
        collection_id(collection)?;
        let ids = child_ids_of(collection);
        self.load_children(&ids).await
    }

    async fn load_children(&mut self, ids: &[RecordId]) -> Result<Vec<RecordHandle>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let found: HashMap<RecordId, RecordHandle> = self
            .fetch_many(Table::Records, &ids_criteria(ids), &SearchOptions::new())
            .await?
            .into_records()
            .into_iter()
            .filter_map(|handle| handle.id().map(|id| (id, handle)))
            .collect();
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    fn require_write(&self, collection: &RecordHandle, id: RecordId) -> Result<()> {
        if collection.read().can_write(self.context()) {
            return Ok(());
        }
        tracing::warn!(
            collection = %id,
            principal = ?self.context().principal(),
            "collection change refused"
        );
        Err(Error::NotAuthorized {
            table: Table::Records,
            id: Some(id),
        })
    }

    /// Writes the collection, putting `previous` back locally if that fails.
    async fn persist_children(
        &mut self,
        collection: &RecordHandle,
        previous: Vec<RecordId>,
    ) -> Result<()> {
        if let Err(error) = self.write(collection).await {
            collection.update(|record| record.context.children = previous);
            return Err(error);
        }
        Ok(())
    }

    /// Returns true when `target` is a descendant of `from`.
    ///
    /// The walk ignores the read predicate, so a hidden intermediate
    /// collection still closes a cycle. Cached instances win over the store.
    async fn reaches(&self, from: RecordId, target: RecordId) -> Result<bool> {
        let mut visited = HashSet::from([from]);
        let mut frontier = vec![from];
        while !frontier.is_empty() {
            let mut lists = Vec::with_capacity(frontier.len());
            let mut uncached = Vec::new();
            for id in frontier.drain(..) {
                match self.cached(Table::Records, id) {
                    Some(handle) => lists.push(child_ids_of(&handle)),
                    None => uncached.push(id),
                }
            }
            if !uncached.is_empty() {
                lists.extend(self.child_lists(&uncached).await?.into_values());
            }
            for child in lists.into_iter().flatten() {
                if child == target {
                    return Ok(true);
                }
                if visited.insert(child) {
                    frontier.push(child);
                }
            }
        }
        Ok(false)
    }

    /// Inserts a written record before position `before`, or appends it.
    ///
    /// Duplicates and anything that would make the collection its own
    /// descendant are rejected.
    pub async fn insert_child(
        &mut self,
        collection: &RecordHandle,
        child: &RecordHandle,
        before: Option<usize>,
    ) -> Result<()> {
        let collection_id = collection_id(collection)?;
        let child_id = child
            .id()
            .ok_or_else(|| Error::InvalidId("child was never written".to_string()))?;
        self.require_write(collection, collection_id)?;
        if collection.read().child_ids().contains(&child_id) {
            return Err(Error::DuplicateChild {
                collection: collection_id,
                child: child_id,
            });
        }
        if child_id == collection_id || self.reaches(child_id, collection_id).await? {
            tracing::warn!(collection = %collection_id, child = %child_id, "cycle refused");
            return Err(Error::CollectionCycle {
                collection: collection_id,
                child: child_id,
            });
        }

        let previous = collection.read().context.children.clone();
        collection.update(|record| {
            let children = &mut record.context.children;
            let index = before.map_or(children.len(), |index| index.min(children.len()));
            children.insert(index, child_id);
        });
        self.persist_children(collection, previous).await
    }

    /// Removes `length` children starting at `index` and returns their ids.
    ///
    /// A negative `length` removes backwards from `index`, inclusive.
    pub async fn delete_children(
        &mut self,
        collection: &RecordHandle,
        index: usize,
        length: isize,
    ) -> Result<Vec<RecordId>> {
        let collection_id = collection_id(collection)?;
        let range = child_range(collection.read().child_ids().len(), index, length);
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.require_write(collection, collection_id)?;

        let previous = collection.read().context.children.clone();
        let removed =
            collection.update(|record| record.context.children.drain(range).collect::<Vec<_>>());
        self.persist_children(collection, previous).await?;
        Ok(removed)
    }

    /// Removes one child by id. Returns false when it was not a child.
    pub async fn remove_child(
        &mut self,
        collection: &RecordHandle,
        child: RecordId,
    ) -> Result<bool> {
        collection_id(collection)?;
        let position = collection
            .read()
            .child_ids()
            .iter()
            .position(|id| *id == child);
        let Some(index) = position else {
            return Ok(false);
        };
        self.delete_children(collection, index, 1).await?;
        Ok(true)
    }

    /// Drops child ids whose rows no longer exist and returns them.
    ///
    /// Existence is checked without a predicate, so children merely hidden
    /// from the caller are kept. Persisting the result is best effort: when
    /// the write fails only the local instance changes.
    pub async fn scrub(&mut self, collection: &RecordHandle) -> Result<Vec<RecordId>> {
        let collection_id = collection_id(collection)?;
        let ids = child_ids_of(collection);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let existing = self.existing_ids(Table::Records, &ids).await?;
        let removed: Vec<RecordId> = ids
            .into_iter()
            .filter(|id| !existing.contains(id))
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        collection.update(|record| record.context.children.retain(|id| existing.contains(id)));
        if let Err(error) = self.write(collection).await {
            tracing::warn!(collection = %collection_id, error = %error, "scrub not persisted");
        }
        tracing::debug!(
            collection = %collection_id,
            removed = removed.len(),
            "collection scrubbed"
        );
        Ok(removed)
    }

    /// Folds over the tree rooted at `root` in depth-first pre-order.
    ///
    /// `f` receives the accumulator, each visible node and its depth. Every
    /// node is visited at most once, even when children are shared or cyclic.
    pub async fn fold_tree<A, F>(&mut self, root: &RecordHandle, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, &RecordHandle, usize) -> A,
    {
        let root_id = root
            .id()
            .ok_or_else(|| Error::InvalidId("record was never written".to_string()))?;
        let mut visited = HashSet::from([root_id]);
        let mut stack = vec![(root.clone(), 0usize)];
        let mut acc = init;
        while let Some((handle, depth)) = stack.pop() {
            acc = f(acc, &handle, depth);
            let ids: Vec<RecordId> = child_ids_of(&handle)
                .into_iter()
                .filter(|id| visited.insert(*id))
                .collect();
            let children = self.load_children(&ids).await?;
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        Ok(acc)
    }

    /// Maps every visible node of the tree rooted at `root`, in pre-order.
    pub async fn map_tree<T, F>(&mut self, root: &RecordHandle, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&RecordHandle, usize) -> T,
    {
        self.fold_tree(root, Vec::new(), |mut acc, handle, depth| {
            acc.push(f(handle, depth));
            acc
        })
        .await
    }

    /// Nested dump of the visible tree rooted at `root`.
    pub async fn hierarchy(&mut self, root: &RecordHandle) -> Result<HierarchyNode> {
        let root_node = HierarchyNode::leaf(root)
            .ok_or_else(|| Error::InvalidId("record was never written".to_string()))?;
        let root_id = root_node.id;

        // Breadth-first into an arena; each entry lists its children's slots.
        let mut arena: Vec<(HierarchyNode, Vec<usize>)> = vec![(root_node, Vec::new())];
        let mut queue = VecDeque::from([(0usize, root.clone())]);
        let mut visited = HashSet::from([root_id]);
        while let Some((slot, handle)) = queue.pop_front() {
            let ids: Vec<RecordId> = child_ids_of(&handle)
                .into_iter()
                .filter(|id| visited.insert(*id))
                .collect();
            for child in self.load_children(&ids).await? {
                let Some(node) = HierarchyNode::leaf(&child) else {
                    continue;
                };
                arena.push((node, Vec::new()));
                let child_slot = arena.len() - 1;
                arena[slot].1.push(child_slot);
                queue.push_back((child_slot, child));
            }
        }

        // Children always sit after their parent, so assemble from the back.
        let mut built: Vec<Option<HierarchyNode>> = vec![None; arena.len()];
        for (slot, (mut node, children)) in arena.into_iter().enumerate().rev() {
            node.children = children
                .into_iter()
                .filter_map(|child| built[child].take())
                .collect();
            built[slot] = Some(node);
        }
        built
            .into_iter()
            .next()
            .flatten()
            .ok_or(Error::NotFound {
                table: Table::Records,
                id: root_id,
            })
    }

    /// Deletes a collection.
    ///
    /// With `with_prejudice`, every child the caller can write is deleted
    /// first, best effort. Returns the ids of the children deleted. Nothing
    /// is touched unless the caller may delete the collection itself.
    pub async fn delete_collection(
        &mut self,
        collection: &RecordHandle,
        with_prejudice: bool,
    ) -> Result<Vec<RecordId>> {
        let collection_id = collection_id(collection)?;
        if self
            .writable_row(Table::Records, collection_id)
            .await?
            .is_none()
        {
            return Err(self
                .refusal(Table::Records, collection_id, Intent::Delete)
                .await);
        }
        let mut deleted = Vec::new();
        let ids = child_ids_of(collection);
        if with_prejudice && !ids.is_empty() {
            let writable = self
                .fetch_many(
                    Table::Records,
                    &ids_criteria(&ids),
                    &SearchOptions::new().write_only().ids_only(),
                )
                .await?
                .into_ids();
            for id in writable {
                match self.delete_by_id(Table::Records, id).await {
                    Ok(()) => deleted.push(id),
                    Err(error) => {
                        tracing::warn!(
                            collection = %collection_id,
                            child = %id,
                            error = %error,
                            "child not deleted"
                        );
                    }
                }
            }
        }
        self.delete(collection).await?;
        Ok(deleted)
    }
}
