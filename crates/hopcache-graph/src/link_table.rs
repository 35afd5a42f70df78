//! Intrinsic link table: the raw directed edges of one job's link graph.
//!
//! An edge records that `source` refers to `target`.  All cached distances
//! run back to the root, so the edge is keyed by the target (the node whose
//! distance may improve) with the source as the node supplying the improved
//! estimate; during recomputation the source therefore acts as the target's
//! *child*.  A source value of `""` is the root itself (seed edges).
//!
//! Edges carry a provenance state so a re-scan pass can tell which previously
//! known edges were reconfirmed: unconfirmed `Base` edges are swept at pass
//! end, everything else collapses back to `Base`.

use ahash::{AHashMap, AHashSet};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::{BatchLimits, DeleteDependency, LinkState, RowId};

/// One directed edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRow {
    pub target: String,
    pub link_type: String,
    pub source: String,
    pub state: LinkState,
    /// The scan process that last touched this edge, while it is `New` or
    /// `Confirmed`.  Cleared when the edge returns to `Base`.
    pub process_id: Option<String>,
}

/// Unique key of an edge within a job.
type LinkKey = (String, String, String); // (target, link_type, source)

/// Indexed edge storage for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkTable {
    rows: AHashMap<RowId, LinkRow>,
    /// Unique index on (target, link type, source).
    by_key: AHashMap<LinkKey, RowId>,
    /// Posting list: target -> edge rows (the target's children).
    by_target: AHashMap<String, RoaringBitmap>,
    /// Posting list: source -> edge rows (for parent lookups and sweeps).
    by_source: AHashMap<String, RoaringBitmap>,
    next_id: RowId,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn row(&self, id: RowId) -> &LinkRow {
        self.rows.get(&id).expect("dangling link row id in index")
    }

    fn key_of(row: &LinkRow) -> LinkKey {
        (
            row.target.clone(),
            row.link_type.clone(),
            row.source.clone(),
        )
    }

    fn insert_row(&mut self, row: LinkRow) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_key.insert(Self::key_of(&row), id);
        self.by_target
            .entry(row.target.clone())
            .or_default()
            .insert(id);
        self.by_source
            .entry(row.source.clone())
            .or_default()
            .insert(id);
        self.rows.insert(id, row);
        id
    }

    fn remove_row(&mut self, id: RowId) {
        let Some(row) = self.rows.remove(&id) else {
            return;
        };
        self.by_key.remove(&Self::key_of(&row));
        if let Some(bits) = self.by_target.get_mut(&row.target) {
            bits.remove(id);
            if bits.is_empty() {
                self.by_target.remove(&row.target);
            }
        }
        if let Some(bits) = self.by_source.get_mut(&row.source) {
            bits.remove(id);
            if bits.is_empty() {
                self.by_source.remove(&row.source);
            }
        }
    }

    /// Record references from `source` to `targets`.  Existing edges are
    /// transitioned to `Confirmed` and stamped with the process id; missing
    /// edges are inserted as `New`.  Returns the targets whose edge did not
    /// previously exist, in input order.
    ///
    /// The existence check runs in backend-sized chunks, mirroring the
    /// predicate limit of the underlying store.
    pub fn record_references(
        &mut self,
        source: &str,
        targets: &[String],
        link_type: &str,
        process_id: &str,
        limits: &BatchLimits,
    ) -> Vec<String> {
        let mut deduped: Vec<&String> = Vec::with_capacity(targets.len());
        let mut seen: AHashSet<&str> = AHashSet::with_capacity(targets.len());
        for target in targets {
            if seen.insert(target.as_str()) {
                deduped.push(target);
            }
        }

        let mut present: AHashSet<String> = AHashSet::new();
        for chunk in limits.chunks(&deduped) {
            for target in chunk {
                let key = (
                    (*target).clone(),
                    link_type.to_string(),
                    source.to_string(),
                );
                if self.by_key.contains_key(&key) {
                    present.insert((*target).clone());
                }
            }
        }

        let mut new_targets = Vec::new();
        for target in deduped {
            if present.contains(target.as_str()) {
                let key = (target.clone(), link_type.to_string(), source.to_string());
                let id = *self.by_key.get(&key).expect("present edge missing from unique index");
                let row = self.rows.get_mut(&id).expect("indexed link row missing");
                row.state = LinkState::Confirmed;
                row.process_id = Some(process_id.to_string());
            } else {
                self.insert_row(LinkRow {
                    target: target.clone(),
                    link_type: link_type.to_string(),
                    source: source.to_string(),
                    state: LinkState::New,
                    process_id: Some(process_id.to_string()),
                });
                new_targets.push(target.clone());
            }
        }
        tracing::debug!(
            source,
            link_type,
            new = new_targets.len(),
            confirmed = present.len(),
            "recorded references"
        );
        new_targets
    }

    /// Delete edges originating at the given sources.  With `base_only`, only
    /// `Base`-state edges go (the end-of-pass sweep of unconfirmed links).
    /// Target-side rows of other sources are deliberately left alone.
    pub fn remove_source_links(&mut self, sources: &[String], base_only: bool) {
        let mut victims: Vec<RowId> = Vec::new();
        for source in sources {
            if let Some(bits) = self.by_source.get(source.as_str()) {
                for id in bits.iter() {
                    let row = self.row(id);
                    if !base_only || row.state == LinkState::Base {
                        victims.push(id);
                    }
                }
            }
        }
        tracing::debug!(count = victims.len(), base_only, "removing source links");
        for id in victims {
            self.remove_row(id);
        }
    }

    /// End-of-pass collapse: `New` and `Confirmed` edges of the given sources
    /// return to `Base`, and their process stamp is cleared.
    pub fn restore_links(&mut self, sources: &[String]) {
        self.collapse(Some(sources), None);
    }

    /// Abort-time rollback: `New` edges of the given sources are discarded,
    /// `Confirmed` edges return to `Base`.
    pub fn revert_links(&mut self, sources: &[String]) {
        let mut victims: Vec<RowId> = Vec::new();
        for source in sources {
            if let Some(bits) = self.by_source.get(source.as_str()) {
                for id in bits.iter() {
                    if self.row(id).state == LinkState::New {
                        victims.push(id);
                    }
                }
            }
        }
        for id in victims {
            self.remove_row(id);
        }
        self.collapse(Some(sources), None);
    }

    /// Startup reset: in-flight provenance state collapses back to `Base`,
    /// optionally only for edges stamped by one process.  Safe because links
    /// are only added transactionally during document processing; the next
    /// scan of the page re-records them properly.
    pub fn restart(&mut self, process_id: Option<&str>) {
        self.collapse(None, process_id);
    }

    fn collapse(&mut self, sources: Option<&[String]>, process_id: Option<&str>) {
        let ids: Vec<RowId> = match sources {
            Some(sources) => sources
                .iter()
                .filter_map(|s| self.by_source.get(s.as_str()))
                .flat_map(|bits| bits.iter())
                .collect(),
            None => self.rows.keys().copied().collect(),
        };
        for id in ids {
            let row = self.rows.get_mut(&id).expect("indexed link row missing");
            if row.state == LinkState::Base {
                continue;
            }
            if let Some(process) = process_id {
                if row.process_id.as_deref() != Some(process) {
                    continue;
                }
            }
            row.state = LinkState::Base;
            row.process_id = None;
        }
    }

    /// The children of `node`: edges pointing at it, as `(link type, source)`
    /// pairs.  These are the nodes whose distances feed `node`'s own.
    pub fn document_children(&self, node: &str) -> Vec<(String, String)> {
        let Some(bits) = self.by_target.get(node) else {
            return Vec::new();
        };
        bits.iter()
            .map(|id| {
                let row = self.row(id);
                (row.link_type.clone(), row.source.clone())
            })
            .collect()
    }

    /// The distinct targets of edges leaving `node`: the documents whose
    /// cached distance may need re-evaluation when `node`'s own improves.
    pub fn document_unique_parents(&self, node: &str) -> Vec<String> {
        let Some(bits) = self.by_source.get(node) else {
            return Vec::new();
        };
        let mut out: Vec<String> = bits
            .iter()
            .map(|id| self.row(id).target.clone())
            .collect::<AHashSet<_>>()
            .into_iter()
            .collect();
        out.sort_unstable();
        out
    }

    /// Whether a live edge matches the dependency, in any provenance state.
    pub fn has_edge(&self, dep: &DeleteDependency) -> bool {
        self.edge_state(dep).is_some()
    }

    /// Whether a live `Base`-state edge matches the dependency.
    pub fn has_base_edge(&self, dep: &DeleteDependency) -> bool {
        self.edge_state(dep) == Some(LinkState::Base)
    }

    fn edge_state(&self, dep: &DeleteDependency) -> Option<LinkState> {
        let key = (
            dep.target.clone(),
            dep.link_type.clone(),
            dep.source.clone(),
        );
        self.by_key.get(&key).map(|&id| self.row(id).state)
    }

    /// Distinct source identifiers satisfying a caller-supplied criterion.
    /// Used to resolve "delete matching documents" requests to a concrete
    /// identifier list before the sweep.
    pub fn sources_matching(&self, criteria: impl Fn(&str) -> bool) -> Vec<String> {
        let mut out: Vec<String> = self
            .by_source
            .keys()
            .filter(|s| !s.is_empty() && criteria(s))
            .cloned()
            .collect();
        out.sort_unstable();
        out
    }

    /// Iterate all edges (test/diagnostic use).
    pub fn iter(&self) -> impl Iterator<Item = &LinkRow> {
        self.rows.values()
    }
}
