//! Per-job operation layer: what the crawler scheduler and connector
//! pipeline actually call.
//!
//! Every method assumes it runs inside an active storage transaction; storage
//! errors are not interpreted here and transactional retry is the caller's
//! concern.  The general shape of graph maintenance:
//!
//! - new references seed the cache optimistically (monotonicity guarantees a
//!   stored finite distance can only ever improve, so an existing row only
//!   needs requeueing when the propagated estimate is *strictly* better);
//! - removals invalidate via the delete-dependency join, whack the affected
//!   rows to the infinite sentinel, and requeue exactly that frontier;
//! - `process_queue` drains a bounded batch through the propagation engine.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use tracing::debug;

use crate::answer::{Answer, AnswerValue};
use crate::propagation::Resolver;
use crate::{
    BatchLimits, CancelToken, DeathMark, DeleteDependency, Distance, JobGraph, Question, Result,
    TrackingMethod, ROOT_NODE,
};

/// Operations over one job's tables, scoped to a transaction.
pub struct JobOps<'a> {
    graph: &'a mut JobGraph,
    legal_link_types: &'a [String],
    method: TrackingMethod,
    limits: BatchLimits,
    cancel: &'a CancelToken,
}

impl<'a> JobOps<'a> {
    pub fn new(
        graph: &'a mut JobGraph,
        legal_link_types: &'a [String],
        method: TrackingMethod,
        limits: BatchLimits,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            graph,
            legal_link_types,
            method,
            limits,
            cancel,
        }
    }

    // ========================================================================
    // Reference recording
    // ========================================================================

    /// Record references from the root to a set of seed documents.
    pub fn record_seed_references(
        &mut self,
        targets: &[String],
        process_id: &str,
    ) -> Result<Vec<bool>> {
        self.do_record(ROOT_NODE, targets, "", process_id)
    }

    /// Record a single reference from `source` to `target`.  Returns whether
    /// the target's cached distance may have changed.
    pub fn record_reference(
        &mut self,
        source: &str,
        target: &str,
        link_type: &str,
        process_id: &str,
    ) -> Result<bool> {
        let flags = self.do_record(
            source,
            std::slice::from_ref(&target.to_string()),
            link_type,
            process_id,
        )?;
        Ok(flags[0])
    }

    /// Record references from `source` to `targets`.  Returns, per target,
    /// whether its cached distance may have changed.
    pub fn record_references(
        &mut self,
        source: &str,
        targets: &[String],
        link_type: &str,
        process_id: &str,
    ) -> Result<Vec<bool>> {
        self.do_record(source, targets, link_type, process_id)
    }

    fn do_record(
        &mut self,
        source: &str,
        targets: &[String],
        link_type: &str,
        process_id: &str,
    ) -> Result<Vec<bool>> {
        let new_targets =
            self.graph
                .links
                .record_references(source, targets, link_type, process_id, &self.limits);

        let mut changed = vec![false; targets.len()];
        if new_targets.is_empty() {
            return Ok(changed);
        }

        debug!(count = new_targets.len(), "queueing documents for new references");

        // Starting estimates propagate from the source's current cached rows.
        // A stale estimate is harmless: if the source row's value later
        // drops, its targets are requeued at that point anyway.  Every legal
        // link type must be covered or a missing target row would read as
        // "infinite" to later callers.
        let estimates = self.source_estimates(source)?;

        let new_flags = add_to_processing_queue(
            &mut *self.graph,
            self.legal_link_types,
            &new_targets,
            &estimates,
            source,
            link_type,
            self.method,
            &self.limits,
        );

        let flag_by_target: AHashMap<&str, bool> = new_targets
            .iter()
            .map(String::as_str)
            .zip(new_flags)
            .collect();
        for (i, target) in targets.iter().enumerate() {
            if flag_by_target.get(target.as_str()).copied().unwrap_or(false) {
                changed[i] = true;
            }
        }
        Ok(changed)
    }

    /// The source document's current answers, one per legal link type.
    fn source_estimates(&self, source: &str) -> Result<Vec<Answer>> {
        if source.is_empty() {
            return Ok(vec![Answer::finite(0); self.legal_link_types.len()]);
        }
        let mut estimates = Vec::with_capacity(self.legal_link_types.len());
        for chunk in self.limits.chunks(self.legal_link_types) {
            for link_type in chunk {
                let question = Question::new(source, link_type.clone());
                let estimate = match self.graph.hops.get(&question) {
                    Some((row_id, row)) => match row.distance {
                        Distance::Finite(v) => {
                            let deps = if self.method != TrackingMethod::NeverDelete {
                                self.graph.deps.deps_for_owner(row_id)
                            } else {
                                Vec::new()
                            };
                            Answer::with_deps(AnswerValue::Finite(v), deps)
                        }
                        Distance::Infinite => Answer::infinite(),
                    },
                    None => Answer::infinite(),
                };
                estimates.push(estimate);
            }
        }
        Ok(estimates)
    }

    // ========================================================================
    // Scan-pass completion and rollback
    // ========================================================================

    /// Complete a recalculation pass for a set of source documents: sweep
    /// their target links that were not reconfirmed, invalidating every cache
    /// row that depended on a swept edge, then collapse provenance state.
    pub fn finish_parents(&mut self, sources: &[String]) -> Result<()> {
        if self.method == TrackingMethod::Accurate && !sources.is_empty() {
            self.invalidate_for_sources(sources, true);
        }
        self.graph.links.restore_links(sources);
        Ok(())
    }

    /// Seed references are special in that their only source is the root.
    pub fn finish_seed_references(&mut self) -> Result<()> {
        self.finish_parents(&[ROOT_NODE.to_string()])
    }

    /// Abort-time rollback of an in-progress scan: in-flight new links are
    /// discarded, reconfirmed ones return to their prior state.
    pub fn revert_parents(&mut self, sources: &[String]) -> Result<()> {
        self.graph.links.revert_links(sources);
        Ok(())
    }

    // ========================================================================
    // Document removal
    // ========================================================================

    /// Remove a set of documents: their outgoing links go away, and every
    /// cache row whose dependency set references one of those links is
    /// invalidated and requeued.
    pub fn delete_document_identifiers(&mut self, documents: &[String]) -> Result<()> {
        if self.method != TrackingMethod::Accurate || documents.is_empty() {
            return Ok(());
        }
        debug!(count = documents.len(), "deleting document identifiers");
        self.invalidate_for_sources(documents, false);
        Ok(())
    }

    /// Resolve a document criterion against known sources and remove the
    /// matches.  Returns the resolved identifiers so the operation can be
    /// logged in concrete form.
    pub fn delete_matching_documents(
        &mut self,
        criteria: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let documents = self.graph.links.sources_matching(criteria);
        self.delete_document_identifiers(&documents)?;
        Ok(documents)
    }

    /// The shared invalidation sweep.  Ordering is load-bearing:
    ///
    /// 1. mark every dependent cache row (`distance := inf`, `Deleting`);
    ///    the rows are whacked to infinity so a cut-off subgraph cannot feed
    ///    stale finite values back during re-evaluation;
    /// 2. remove the edges themselves, *before* the queue is evaluated;
    /// 3. drop the dependency rows owned by the marked set;
    /// 4. flip the marked set to `Queued`.
    ///
    /// The queued frontier is then exactly what needs re-evaluation, and
    /// propagation either restores a finite value via an alternate path or
    /// deletes the row.
    fn invalidate_for_sources(&mut self, sources: &[String], base_only: bool) {
        let JobGraph { links, hops, deps } = &mut *self.graph;

        let owners: RoaringBitmap = deps.owners_for_sources(sources, base_only, links, &self.limits);
        debug!(
            owners = owners.len(),
            base_only, "marking dependent hop rows for invalidation"
        );
        hops.mark_deleting(&owners);

        links.remove_source_links(sources, base_only);

        deps.remove_marked_rows(hops);

        let requeued = hops.requeue_deleting();
        debug!(requeued, "invalidation sweep queued rows for re-evaluation");
    }

    // ========================================================================
    // Queue processing and reads
    // ========================================================================

    /// Pull a bounded batch of queued rows and run the propagation engine
    /// over them.  Returns whether the queue is now empty.
    pub fn process_queue(&mut self) -> Result<bool> {
        let questions = self.graph.hops.queued_batch(self.limits.queue_batch);
        if questions.is_empty() {
            return Ok(true);
        }
        debug!(count = questions.len(), "processing hop-distance queue");

        // The answers themselves are irrelevant here; the point is that the
        // rows leave the queue with trustworthy values written back.
        let mut resolver =
            Resolver::new(&mut *self.graph, self.method, self.limits.clone(), self.cancel);
        resolver.ask(&questions)?;
        Ok(false)
    }

    /// Best-effort cached distances for a set of documents.  Only an upper
    /// bound unless the queue has been drained.
    pub fn find_hop_counts(&self, nodes: &[String], link_type: &str) -> Vec<Distance> {
        self.graph.hops.distances(nodes, link_type, &self.limits)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Startup reset: collapse in-flight link provenance (for one process, or
    /// all of them) and requeue any rows a dead process left mid-sweep.  A
    /// `Deleting` row can never be trusted again, but re-running propagation
    /// over a queued row is always correct, merely redundant.
    pub fn restart(&mut self, process_id: Option<&str>) -> Result<()> {
        self.graph.links.restart(process_id);
        let requeued = self.graph.hops.requeue_deleting();
        if requeued > 0 {
            debug!(requeued, "requeued rows left mid-invalidation");
        }
        Ok(())
    }
}

// ============================================================================
// Queue admission
// ============================================================================

/// Seed or requeue cache rows for `targets` after the link from `source` was
/// added or its distance improved.
///
/// For every (target, affected link type) pair: a target with no cache row
/// gets one inserted immediately with the propagated estimate. That is valid
/// because a brand-new row has neither other paths to it nor rows depending
/// on it, so the estimate is final until the source itself improves.  A target with an
/// existing row is only queued when the propagated estimate is strictly
/// better; otherwise the row is left untouched.
///
/// Dependency rows of rows that stay queued are deliberately not touched:
/// they record *a* minimal path, which remains valid grounds for
/// invalidation even if it is no longer *the* minimal path.
///
/// Returns, per target, whether its distance may have changed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_to_processing_queue(
    graph: &mut JobGraph,
    affected_link_types: &[String],
    targets: &[String],
    starting_answers: &[Answer],
    source: &str,
    link_type: &str,
    method: TrackingMethod,
    limits: &BatchLimits,
) -> Vec<bool> {
    debug!(
        targets = targets.len(),
        source,
        link_type,
        affected = affected_link_types.len(),
        "adding documents to the processing queue"
    );

    // Chunked sweep for the rows that already exist.
    let mut existing: AHashMap<Question, Distance> = AHashMap::new();
    for chunk in limits.chunks(targets) {
        for target in chunk {
            for affected in affected_link_types {
                let question = Question::new(target.clone(), affected.clone());
                if let Some((_, row)) = graph.hops.get(&question) {
                    existing.insert(question, row.distance);
                }
            }
        }
    }

    let mut changed = vec![false; targets.len()];
    let mut to_queue: Vec<Question> = Vec::new();

    for (i, target) in targets.iter().enumerate() {
        for (j, affected) in affected_link_types.iter().enumerate() {
            let starting = &starting_answers[j];
            let candidate = match starting.value() {
                AnswerValue::Finite(v) if affected == link_type => AnswerValue::Finite(v + 1),
                other => other,
            };
            let question = Question::new(target.clone(), affected.clone());

            match existing.get(&question) {
                None => {
                    let distance = match candidate {
                        AnswerValue::Finite(v) => Distance::Finite(v),
                        _ => Distance::Infinite,
                    };
                    debug!(%question, %distance, "inserting fresh hop row for new reference");
                    let row_id = graph.hops.insert(
                        target.clone(),
                        affected.clone(),
                        distance,
                        DeathMark::Normal,
                    );
                    if method != TrackingMethod::NeverDelete {
                        graph.deps.write_dependency(
                            row_id,
                            DeleteDependency::new(link_type, target.clone(), source),
                        );
                        for dep in starting.deps() {
                            graph.deps.write_dependency(row_id, dep.clone());
                        }
                    }
                }
                Some(stored) => {
                    let better = match (candidate, stored) {
                        (AnswerValue::Finite(_), Distance::Infinite) => true,
                        (AnswerValue::Finite(new), Distance::Finite(old)) => new < *old,
                        _ => false,
                    };
                    if better {
                        changed[i] = true;
                        to_queue.push(question);
                    } else {
                        debug!(%question, "existing distance is no worse; not queueing");
                    }
                }
            }
        }
    }

    for chunk in limits.chunks(&to_queue) {
        for question in chunk {
            graph.hops.mark_queued_if_eligible(question);
        }
    }

    changed
}
