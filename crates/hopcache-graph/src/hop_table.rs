//! Hop-distance cache table for one job.
//!
//! Each row caches the minimum number of type-matching hops from a document
//! back to the root.  Only rows whose death-mark is `Normal` hold trustworthy
//! values; a missing row means "infinite" once the queue has drained.  The
//! mark walks `Normal -> Queued -> (recomputed) Normal | deleted`, with
//! `Deleting` used transiently inside bulk invalidation sweeps between
//! marking and requeue.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::{BatchLimits, DeathMark, Distance, Question, RowId};

/// One cached distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopRow {
    pub node: String,
    pub link_type: String,
    pub distance: Distance,
    pub mark: DeathMark,
}

/// Indexed cache storage for one job.  Unique on `(node, link type)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopTable {
    rows: AHashMap<RowId, HopRow>,
    by_question: AHashMap<Question, RowId>,
    /// Rows currently marked `Queued`.
    queued: RoaringBitmap,
    /// Rows currently marked `Deleting`.
    deleting: RoaringBitmap,
    next_id: RowId,
}

impl HopTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len() as usize
    }

    pub fn row(&self, id: RowId) -> Option<&HopRow> {
        self.rows.get(&id)
    }

    fn row_ref(&self, id: RowId) -> &HopRow {
        self.rows.get(&id).expect("dangling hop row id in index")
    }

    /// Look up the row for a question, if one exists.
    pub fn get(&self, question: &Question) -> Option<(RowId, &HopRow)> {
        let id = *self.by_question.get(question)?;
        Some((id, self.row_ref(id)))
    }

    pub fn insert(
        &mut self,
        node: impl Into<String>,
        link_type: impl Into<String>,
        distance: Distance,
        mark: DeathMark,
    ) -> RowId {
        let node = node.into();
        let link_type = link_type.into();
        let question = Question::new(node.clone(), link_type.clone());
        debug_assert!(
            !self.by_question.contains_key(&question),
            "duplicate hop row for {question}"
        );
        let id = self.next_id;
        self.next_id += 1;
        self.by_question.insert(question, id);
        self.note_mark(id, mark);
        self.rows.insert(
            id,
            HopRow {
                node,
                link_type,
                distance,
                mark,
            },
        );
        id
    }

    pub fn delete(&mut self, id: RowId) {
        if let Some(row) = self.rows.remove(&id) {
            self.by_question
                .remove(&Question::new(row.node, row.link_type));
            self.queued.remove(id);
            self.deleting.remove(id);
        }
    }

    fn note_mark(&mut self, id: RowId, mark: DeathMark) {
        self.queued.remove(id);
        self.deleting.remove(id);
        match mark {
            DeathMark::Queued => {
                self.queued.insert(id);
            }
            DeathMark::Deleting => {
                self.deleting.insert(id);
            }
            DeathMark::Normal => {}
        }
    }

    /// Rewrite a row's distance and mark together.
    pub fn update(&mut self, id: RowId, distance: Distance, mark: DeathMark) {
        self.note_mark(id, mark);
        let row = self.rows.get_mut(&id).expect("hop row missing on update");
        row.distance = distance;
        row.mark = mark;
    }

    pub fn set_mark(&mut self, id: RowId, mark: DeathMark) {
        self.note_mark(id, mark);
        let row = self.rows.get_mut(&id).expect("hop row missing on mark");
        row.mark = mark;
    }

    /// Queue a row for recomputation, but only if it is currently `Normal` or
    /// `Deleting`.  Rows already queued are left alone to keep update churn
    /// (and, on a shared backend, deadlock exposure) down.
    pub fn mark_queued_if_eligible(&mut self, question: &Question) {
        if let Some(&id) = self.by_question.get(question) {
            let mark = self.row_ref(id).mark;
            if matches!(mark, DeathMark::Normal | DeathMark::Deleting) {
                tracing::debug!(%question, "queueing hop row");
                self.set_mark(id, DeathMark::Queued);
            }
        }
    }

    /// Invalidation sweep, step one: whack the given rows to the infinite
    /// sentinel and mark them `Deleting`.  The sentinel prevents a cut-off
    /// subgraph from feeding stale finite values back during re-evaluation.
    pub fn mark_deleting(&mut self, owners: &RoaringBitmap) {
        for id in owners.iter() {
            if self.rows.contains_key(&id) {
                self.update(id, Distance::Infinite, DeathMark::Deleting);
            }
        }
    }

    /// Rows currently in the `Deleting` state.
    pub fn deleting_rows(&self) -> Vec<RowId> {
        self.deleting.iter().collect()
    }

    /// Invalidation sweep, final step: flip `Deleting` rows to `Queued`.
    /// Returns how many rows were requeued.
    pub fn requeue_deleting(&mut self) -> usize {
        let ids: Vec<RowId> = self.deleting.iter().collect();
        for &id in &ids {
            self.set_mark(id, DeathMark::Queued);
        }
        ids.len()
    }

    /// Pull up to `limit` queued rows to seed a propagation pass.  The caller
    /// holds the job transaction, which is what makes this a read-for-update.
    pub fn queued_batch(&self, limit: usize) -> Vec<Question> {
        self.queued
            .iter()
            .take(limit)
            .map(|id| {
                let row = self.row_ref(id);
                Question::new(row.node.clone(), row.link_type.clone())
            })
            .collect()
    }

    /// Best-effort bulk distance read, chunked to the backend predicate
    /// limit.  Stored values are returned regardless of mark (so the result
    /// is only an upper bound unless the queue has drained); absence maps to
    /// the infinite sentinel.
    pub fn distances(
        &self,
        nodes: &[String],
        link_type: &str,
        limits: &BatchLimits,
    ) -> Vec<Distance> {
        let mut out = vec![Distance::Infinite; nodes.len()];
        let indexed: Vec<(usize, &String)> = nodes.iter().enumerate().collect();
        for chunk in limits.chunks(&indexed) {
            for (i, node) in chunk {
                let question = Question::new((*node).clone(), link_type);
                if let Some((_, row)) = self.get(&question) {
                    out[*i] = row.distance;
                }
            }
        }
        out
    }

    /// Iterate all rows (test/diagnostic use).
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &HopRow)> {
        self.rows.iter().map(|(&id, row)| (id, row))
    }
}
