//! Delete-dependency table for one job.
//!
//! For every cached distance, the edges its derivation actually used.  The
//! set records *a* minimal path, not *the* minimal path: when a better
//! derivation is adopted the whole set is replaced, so removing any listed
//! edge is sufficient (and necessary) grounds to re-evaluate the owner.
//!
//! Keeping only the best derivation's edges is what keeps this table small
//! enough to be cheaper than the recomputation it avoids.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::{BatchLimits, DeleteDependency, HopTable, LinkTable, RowId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepRow {
    /// The hop-cache row this dependency justifies.
    pub owner: RowId,
    pub dep: DeleteDependency,
}

/// Indexed dependency storage for one job.  Unique on `(owner, edge)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepTable {
    rows: AHashMap<RowId, DepRow>,
    by_unique: AHashMap<(RowId, DeleteDependency), RowId>,
    /// Posting list: owner -> dependency rows.
    by_owner: AHashMap<RowId, RoaringBitmap>,
    /// Posting list: edge source -> dependency rows.  This is the index the
    /// invalidation join walks.
    by_source: AHashMap<String, RoaringBitmap>,
    next_id: RowId,
}

impl DepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Record that `owner`'s distance relies on `dep`.  Idempotent per the
    /// unique index.
    pub fn write_dependency(&mut self, owner: RowId, dep: DeleteDependency) {
        let unique = (owner, dep.clone());
        if self.by_unique.contains_key(&unique) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_unique.insert(unique, id);
        self.by_owner.entry(owner).or_default().insert(id);
        self.by_source
            .entry(dep.source.clone())
            .or_default()
            .insert(id);
        self.rows.insert(id, DepRow { owner, dep });
    }

    pub fn delete_dependency(&mut self, owner: RowId, dep: &DeleteDependency) {
        if let Some(id) = self.by_unique.remove(&(owner, dep.clone())) {
            self.remove_row(id);
        }
    }

    fn remove_row(&mut self, id: RowId) {
        let Some(row) = self.rows.remove(&id) else {
            return;
        };
        self.by_unique.remove(&(row.owner, row.dep.clone()));
        if let Some(bits) = self.by_owner.get_mut(&row.owner) {
            bits.remove(id);
            if bits.is_empty() {
                self.by_owner.remove(&row.owner);
            }
        }
        if let Some(bits) = self.by_source.get_mut(&row.dep.source) {
            bits.remove(id);
            if bits.is_empty() {
                self.by_source.remove(&row.dep.source);
            }
        }
    }

    /// Drop every dependency row belonging to the given owners.
    pub fn delete_owner_rows(&mut self, owners: impl IntoIterator<Item = RowId>) {
        for owner in owners {
            if let Some(bits) = self.by_owner.remove(&owner) {
                for id in bits.iter() {
                    self.remove_row(id);
                }
            }
        }
    }

    /// Bulk form used by invalidation sweeps: drop every dependency row
    /// owned by a cache row currently marked for death.
    pub fn remove_marked_rows(&mut self, hops: &HopTable) {
        self.delete_owner_rows(hops.deleting_rows());
    }

    fn row(&self, id: RowId) -> &DepRow {
        self.rows.get(&id).expect("dangling dependency row id in index")
    }

    /// The edges currently justifying `owner`'s distance.
    pub fn deps_for_owner(&self, owner: RowId) -> Vec<DeleteDependency> {
        let Some(bits) = self.by_owner.get(&owner) else {
            return Vec::new();
        };
        bits.iter().map(|id| self.row(id).dep.clone()).collect()
    }

    /// The invalidation join: owners whose dependency set references an edge
    /// that (a) originates at one of `sources` and (b) still exists in the
    /// link table, restricted to `Base`-state edges for end-of-pass sweeps.
    /// Chunked over the source list per the backend predicate limit.
    pub fn owners_for_sources(
        &self,
        sources: &[String],
        base_only: bool,
        links: &LinkTable,
        limits: &BatchLimits,
    ) -> RoaringBitmap {
        let mut owners = RoaringBitmap::new();
        for chunk in limits.chunks(sources) {
            for source in chunk {
                let Some(bits) = self.by_source.get(source.as_str()) else {
                    continue;
                };
                for id in bits.iter() {
                    let row = self.row(id);
                    let live = if base_only {
                        links.has_base_edge(&row.dep)
                    } else {
                        links.has_edge(&row.dep)
                    };
                    if live {
                        owners.insert(row.owner);
                    }
                }
            }
        }
        owners
    }
}
