//! The propagation engine: a transaction-scoped worklist solver.
//!
//! One [`Resolver`] lives for a single invocation.  It is seeded with a set
//! of questions (typically the queued cache rows), walks the live edge graph
//! loading children in batches, and converges on final distances which it
//! writes through to the cache.  Everything is iterative (two explicit
//! worklists, no recursion) so deep or cyclic graphs cannot grow the stack.
//!
//! Computation nodes live in an arena indexed by question; parent/child
//! relationships are arena indexes, never owning references, and duplicate
//! questions raised by different parents merge into one node with each
//! parent's interest tracked separately.
//!
//! The two worklists:
//! - the **fetch queue** holds nodes whose children have not been loaded yet;
//! - the **evaluation queue** holds nodes whose tracked children changed.
//!
//! Evaluation always has priority: fetching expands the frontier, and there
//! is no point expanding while settled answers are waiting to shrink it.  A
//! node is complete once its trial answer reaches its best-possible lower
//! bound, or once no incomplete children remain.  When both queues drain with
//! incomplete nodes left, which is only possible when a cycle is not attached
//! to any completing path, those nodes are finalized from whatever their
//! complete children say.  That forced answer can under-determine cycle-only
//! subgraphs; downstream hop filters rely on this exact behavior.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use tracing::debug;

use crate::answer::{Answer, AnswerValue};
use crate::ops::add_to_processing_queue;
use crate::{
    BatchLimits, CancelToken, DeathMark, Distance, HopError, JobGraph, Question, Result, RowId,
    TrackingMethod,
};

type NodeIx = usize;

// ============================================================================
// Computation nodes
// ============================================================================

/// Per-question state during one propagation session.
#[derive(Debug)]
struct ComputeNode {
    question: Question,
    /// The backing cache row, when one was read in a recomputable state.
    db_row: Option<RowId>,
    /// The distance that row held when read.
    db_distance: AnswerValue,
    /// Answer over completed children only: the fixed floor every
    /// re-evaluation starts from.
    starting: Answer,
    /// Best answer so far, incomplete children included.  Once the node is
    /// complete this is the final answer.
    trial: Answer,
    /// Optimistic lower bound from the known child edges: 0 if any known
    /// child link does not increment, 1 if all do, infinite with no children.
    best_possible: AnswerValue,
    complete: bool,
    /// Whether completion must write through to the cache.
    write_needed: bool,
    /// A caller outside the session awaits this answer; such nodes are never
    /// discarded.
    external: bool,
    /// Parents still tracking this node, by arena index.
    parents: AHashSet<NodeIx>,
    /// Incomplete children still tracked, as (child index, edge link type).
    children: AHashSet<(NodeIx, String)>,
}

impl ComputeNode {
    fn new(question: Question) -> Self {
        Self {
            question,
            db_row: None,
            db_distance: AnswerValue::Unknown,
            starting: Answer::unknown(),
            trial: Answer::unknown(),
            best_possible: AnswerValue::Finite(0),
            complete: false,
            write_needed: true,
            external: false,
            parents: AHashSet::new(),
            children: AHashSet::new(),
        }
    }

    /// Back to "unknown": used when the cache row turns out to be queued and
    /// its value cannot be trusted.
    fn reset(&mut self) {
        self.complete = false;
        self.write_needed = true;
        self.db_row = None;
        self.db_distance = AnswerValue::Unknown;
        self.starting = Answer::unknown();
        self.trial = Answer::unknown();
        self.best_possible = AnswerValue::Finite(0);
    }

    fn settle(&mut self, answer: Answer, write_needed: bool) {
        self.starting = answer.clone();
        self.trial = answer;
        self.complete = true;
        self.write_needed = write_needed;
    }

    fn needed(&self) -> bool {
        self.external || !self.parents.is_empty()
    }
}

// ============================================================================
// Worklists
// ============================================================================

/// FIFO with set-membership so a node is queued at most once.
#[derive(Debug, Default)]
struct Worklist {
    queue: VecDeque<NodeIx>,
    members: AHashSet<NodeIx>,
}

impl Worklist {
    fn push(&mut self, ix: NodeIx) {
        if self.members.insert(ix) {
            self.queue.push_back(ix);
        }
    }

    fn pop(&mut self) -> Option<NodeIx> {
        let ix = self.queue.pop_front()?;
        self.members.remove(&ix);
        Some(ix)
    }

    fn drain_all(&mut self) -> Vec<NodeIx> {
        self.members.clear();
        self.queue.drain(..).collect()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// One propagation session over one job's tables.
pub struct Resolver<'a> {
    graph: &'a mut JobGraph,
    method: TrackingMethod,
    limits: BatchLimits,
    cancel: &'a CancelToken,
    nodes: Vec<ComputeNode>,
    lookup: AHashMap<Question, NodeIx>,
    fetch: Worklist,
    eval: Worklist,
}

impl<'a> Resolver<'a> {
    pub fn new(
        graph: &'a mut JobGraph,
        method: TrackingMethod,
        limits: BatchLimits,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            graph,
            method,
            limits,
            cancel,
            nodes: Vec::new(),
            lookup: AHashMap::new(),
            fetch: Worklist::default(),
            eval: Worklist::default(),
        }
    }

    /// Resolve a batch of questions to final answers, writing changed
    /// distances through to the cache as nodes complete.
    pub fn ask(&mut self, questions: &[Question]) -> Result<Vec<AnswerValue>> {
        debug!(count = questions.len(), "resolving hop questions");

        let asked = self.queue_questions(questions)?;
        for &ix in &asked {
            self.nodes[ix].external = true;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(HopError::Interrupted);
            }

            if asked.iter().all(|&ix| self.nodes[ix].complete) {
                break;
            }

            // Evaluation drains before fetching expands the frontier.
            if let Some(ix) = self.eval.pop() {
                self.evaluate(ix)?;
                continue;
            }

            let batch = self.fetch.drain_all();
            if !batch.is_empty() {
                self.fetch_children(batch)?;
                continue;
            }

            // Both queues dry with incomplete nodes left: cycles without a
            // completing path.  Finalize them from what their complete
            // children said; possibly under-determined, deliberately so.
            let leftovers: Vec<NodeIx> = self
                .lookup
                .values()
                .copied()
                .filter(|&ix| !self.nodes[ix].complete)
                .collect();
            debug!(count = leftovers.len(), "forcing completion of leftover nodes");
            for ix in leftovers {
                self.complete_node(ix)?;
            }
            break;
        }

        Ok(asked
            .iter()
            .map(|&ix| {
                let node = &self.nodes[ix];
                if node.complete {
                    node.trial.value()
                } else {
                    AnswerValue::Unknown
                }
            })
            .collect())
    }

    fn alloc(&mut self, question: Question) -> NodeIx {
        let ix = self.nodes.len();
        self.lookup.insert(question.clone(), ix);
        self.nodes.push(ComputeNode::new(question));
        ix
    }

    /// Materialize arena nodes for a set of questions, reading the cache for
    /// unseen ones and queueing those that need recomputation.  Duplicate
    /// questions resolve to the same node.
    fn queue_questions(&mut self, questions: &[Question]) -> Result<Vec<NodeIx>> {
        let mut unseen: Vec<Question> = Vec::new();
        let mut requested: AHashSet<&Question> = AHashSet::new();
        for question in questions {
            if self.lookup.contains_key(question) {
                continue;
            }
            if question.is_root() {
                // The root is at distance zero by definition; it is answered
                // on the spot and never recomputed.
                let ix = self.alloc(question.clone());
                self.nodes[ix].settle(Answer::finite(0), false);
                continue;
            }
            if requested.insert(question) {
                unseen.push(question.clone());
            }
        }

        if !unseen.is_empty() {
            self.read_cached_nodes(unseen)?;
        }

        Ok(questions
            .iter()
            .map(|q| *self.lookup.get(q).expect("question allocated above"))
            .collect())
    }

    /// Load cache rows for questions not yet in the arena.  A missing row or
    /// a trusted `Normal` row settles the node immediately; a `Queued` row
    /// resets it for recomputation and sends it to the fetch queue.  Seeing
    /// `Deleting` mid-propagation means the invalidation sweep protocol was
    /// broken somewhere upstream.
    fn read_cached_nodes(&mut self, questions: Vec<Question>) -> Result<()> {
        // Until a row says otherwise, absence of a row is a final "infinite".
        for question in &questions {
            let ix = self.alloc(question.clone());
            self.nodes[ix].settle(Answer::infinite(), false);
        }

        let mut deps_wanted: Vec<(RowId, NodeIx)> = Vec::new();
        for chunk in self.limits.chunks(&questions) {
            for question in chunk {
                let Some((row_id, row)) = self.graph.hops.get(question) else {
                    continue;
                };
                let ix = *self.lookup.get(question).expect("question allocated above");
                match row.mark {
                    DeathMark::Queued => {
                        // On the queue: the value cannot be trusted.  Keep the
                        // row handle so write-through can find it again.
                        debug!(%question, "cache row is queued; treating as unknown");
                        let stored = match row.distance {
                            Distance::Finite(v) => AnswerValue::Finite(v),
                            Distance::Infinite => AnswerValue::Infinite,
                        };
                        let node = &mut self.nodes[ix];
                        node.reset();
                        node.db_row = Some(row_id);
                        node.db_distance = stored;
                    }
                    DeathMark::Deleting => {
                        return Err(HopError::Consistency(format!(
                            "hop row {question} surfaced in the deleting state during propagation"
                        )));
                    }
                    DeathMark::Normal => match row.distance {
                        Distance::Infinite => {
                            // Already settled as infinite above.
                        }
                        Distance::Finite(v) => {
                            self.nodes[ix].settle(Answer::finite(v), false);
                            deps_wanted.push((row_id, ix));
                        }
                    },
                }
            }
        }

        // Fetch dependency sets for the finite rows, in bulk.
        for chunk in self.limits.chunks(&deps_wanted) {
            for &(row_id, ix) in chunk {
                let deps = self.graph.deps.deps_for_owner(row_id);
                let node = &mut self.nodes[ix];
                let value = node.trial.value();
                node.starting = Answer::with_deps(value, deps.iter().cloned());
                node.trial = Answer::with_deps(value, deps);
            }
        }

        for question in &questions {
            let ix = *self.lookup.get(question).expect("question allocated above");
            if !self.nodes[ix].complete {
                self.fetch.push(ix);
            }
        }
        Ok(())
    }

    /// Load children for a batch of nodes and initialize their answers.
    /// Child lookups run as one chunked sweep across the whole frontier
    /// rather than node by node.
    fn fetch_children(&mut self, batch: Vec<NodeIx>) -> Result<()> {
        debug!(count = batch.len(), "fetching children for frontier");

        let mut frontier_nodes: Vec<String> = Vec::new();
        let mut seen: AHashSet<String> = AHashSet::new();
        for &ix in &batch {
            let node = &self.nodes[ix];
            debug_assert!(!node.question.is_root(), "root never reaches the fetch queue");
            if !node.needed() {
                // Nobody cares about this answer anymore.  Drop it from the
                // lookup; it still participates in this round's bulk fetch.
                debug!(question = %node.question, "discarding unneeded node before child fetch");
                self.lookup.remove(&node.question);
            }
            if seen.insert(node.question.node.clone()) {
                frontier_nodes.push(node.question.node.clone());
            }
        }

        // One chunked sweep over the link table for the whole frontier.
        let mut references: AHashMap<String, Vec<(String, String)>> = AHashMap::new();
        for chunk in self.limits.chunks(&frontier_nodes) {
            for node_id in chunk {
                references.insert(node_id.clone(), self.graph.links.document_children(node_id));
            }
        }

        // Raise child questions (parent's link type, child's identifier) and
        // materialize their nodes.
        let mut child_questions: Vec<Question> = Vec::new();
        let mut asked: AHashSet<Question> = AHashSet::new();
        for &ix in &batch {
            let question = &self.nodes[ix].question;
            let refs = references
                .get(&question.node)
                .expect("frontier node fetched above");
            for (_, source) in refs {
                let child = Question::new(source.clone(), question.link_type.clone());
                if asked.insert(child.clone()) {
                    child_questions.push(child);
                }
            }
        }
        self.queue_questions(&child_questions)?;

        // Initialize each fetched node from its children.
        for &ix in &batch {
            let question = self.nodes[ix].question.clone();
            let mut starting = Answer::infinite();
            let mut trial = Answer::infinite();
            let mut best_possible = AnswerValue::Infinite;

            let child_refs = references
                .get(&question.node)
                .expect("frontier node fetched above")
                .clone();
            for (edge_link_type, source) in &child_refs {
                let increments = edge_link_type == &question.link_type;
                let floor = if increments { 1 } else { 0 };
                best_possible = match best_possible {
                    AnswerValue::Finite(b) if b <= floor => AnswerValue::Finite(b),
                    _ => AnswerValue::Finite(floor),
                };

                let child_ix = *self
                    .lookup
                    .get(&Question::new(source.clone(), question.link_type.clone()))
                    .expect("child question raised above");
                let child_complete = self.nodes[child_ix].complete;
                let child_answer = self.nodes[child_ix].trial.clone();
                if child_complete {
                    // Completed children fold into the floor and are not
                    // tracked further.
                    starting.merge(
                        &child_answer,
                        increments,
                        edge_link_type,
                        &question.node,
                        source,
                    );
                    trial.merge(
                        &child_answer,
                        increments,
                        edge_link_type,
                        &question.node,
                        source,
                    );
                } else {
                    self.nodes[child_ix].parents.insert(ix);
                    self.nodes[ix]
                        .children
                        .insert((child_ix, edge_link_type.clone()));
                    trial.merge(
                        &child_answer,
                        increments,
                        edge_link_type,
                        &question.node,
                        source,
                    );
                }
            }

            self.nodes[ix].starting = starting;
            self.nodes[ix].best_possible = best_possible;
            debug!(
                %question,
                trial = ?trial.value(),
                best_possible = ?best_possible,
                "initialized node from children"
            );

            if trial.value() == best_possible {
                self.nodes[ix].trial = trial;
                self.complete_node(ix)?;
            } else if self.nodes[ix].children.is_empty() {
                self.nodes[ix].trial = trial;
                self.complete_node(ix)?;
            } else {
                self.nodes[ix].trial = trial;
            }

            self.queue_parents(ix);
        }
        Ok(())
    }

    /// Re-evaluate a node whose tracked children changed.
    fn evaluate(&mut self, ix: NodeIx) -> Result<()> {
        let question = self.nodes[ix].question.clone();
        debug!(
            %question,
            starting = ?self.nodes[ix].starting.value(),
            trial = ?self.nodes[ix].trial.value(),
            "evaluating node"
        );

        // Fold children that completed since last time into the starting
        // answer, then drop them; only incomplete children can still lower
        // the answer.
        let mut base = self.nodes[ix].starting.clone();
        let tracked: Vec<(NodeIx, String)> = self.nodes[ix].children.iter().cloned().collect();
        let mut finished: Vec<(NodeIx, String)> = Vec::new();
        for (child_ix, edge_link_type) in &tracked {
            if self.nodes[*child_ix].complete {
                let child_answer = self.nodes[*child_ix].trial.clone();
                let source = self.nodes[*child_ix].question.node.clone();
                base.merge(
                    &child_answer,
                    edge_link_type == &question.link_type,
                    edge_link_type,
                    &question.node,
                    &source,
                );
                finished.push((*child_ix, edge_link_type.clone()));
            }
        }
        for (child_ix, edge_link_type) in finished {
            self.nodes[child_ix].parents.remove(&ix);
            self.nodes[ix].children.remove(&(child_ix, edge_link_type));
        }
        self.nodes[ix].starting = base.clone();

        // Trial answer: the new floor plus whatever the still-incomplete
        // children currently claim.
        let mut trial = base;
        let remaining: Vec<(NodeIx, String)> = self.nodes[ix].children.iter().cloned().collect();
        for (child_ix, edge_link_type) in remaining {
            let child_answer = self.nodes[child_ix].trial.clone();
            let source = self.nodes[child_ix].question.node.clone();
            trial.merge(
                &child_answer,
                edge_link_type == question.link_type,
                &edge_link_type,
                &question.node,
                &source,
            );
        }

        let mut signal_parents = trial.value() != self.nodes[ix].trial.value();

        if trial.value() == self.nodes[ix].best_possible {
            debug!(%question, trial = ?trial.value(), "complete: reached best-possible bound");
            self.nodes[ix].trial = trial;
            self.complete_node(ix)?;
            signal_parents = true;
        } else if self.nodes[ix].children.is_empty() {
            debug!(%question, trial = ?trial.value(), "complete: no incomplete children left");
            self.nodes[ix].trial = trial;
            self.complete_node(ix)?;
            signal_parents = true;
        } else {
            self.nodes[ix].trial = trial;
            if !self.nodes[ix].needed() {
                // Incomplete and nobody cares: drop it.
                debug!(%question, "discarding unneeded node");
                self.lookup.remove(&question);
                self.detach_children(ix);
                return Ok(());
            }
        }

        if signal_parents {
            self.queue_parents(ix);
        }
        Ok(())
    }

    /// Requeue parents whose evaluation may now proceed.  Parents that have
    /// not been initialized yet (trial still unknown) are skipped; child
    /// fetching will pick them up.
    fn queue_parents(&mut self, ix: NodeIx) {
        let parents: Vec<NodeIx> = self.nodes[ix].parents.iter().copied().collect();
        for parent in parents {
            if self.nodes[parent].trial.value() != AnswerValue::Unknown {
                self.eval.push(parent);
            }
        }
    }

    /// Finalize a node: detach children, and write the answer through to the
    /// cache if this session is responsible for it.
    fn complete_node(&mut self, ix: NodeIx) -> Result<()> {
        if !self.nodes[ix].complete {
            self.nodes[ix].complete = true;
            self.nodes[ix].write_needed = true;
        }
        self.detach_children(ix);
        if self.nodes[ix].write_needed {
            self.write_distance(ix)?;
            self.nodes[ix].write_needed = false;
        }
        Ok(())
    }

    fn detach_children(&mut self, ix: NodeIx) {
        let children = std::mem::take(&mut self.nodes[ix].children);
        for (child_ix, _) in children {
            self.nodes[child_ix].parents.remove(&ix);
        }
    }

    /// Write-through of a finalized answer.
    ///
    /// Strictly better than the stored value: update the row and its
    /// dependency set, then requeue the node's parents, whose best-possible
    /// bound may now be reachable.  Equal: nothing to do beyond unmarking.
    /// Worse: the queuing discipline is broken; fail loudly.  Infinite:
    /// delete the row so the table only ever holds reachable nodes.
    fn write_distance(&mut self, ix: NodeIx) -> Result<()> {
        let question = self.nodes[ix].question.clone();
        let answer = self.nodes[ix].trial.clone();
        let value = match answer.value() {
            // An unknown answer (forced completion of a node that never got
            // initialized) records nothing.
            AnswerValue::Unknown => return Ok(()),
            value => value,
        };

        if let Some(row_id) = self.nodes[ix].db_row {
            let stored = self.nodes[ix].db_distance;

            let AnswerValue::Finite(new_value) = value else {
                debug!(%question, "distance now infinite; deleting cached row");
                self.graph.deps.delete_owner_rows([row_id]);
                self.graph.hops.delete(row_id);
                return Ok(());
            };

            if let AnswerValue::Finite(old) = stored {
                if old < new_value {
                    return Err(HopError::Consistency(format!(
                        "stored distance {old} for {question} is better than recomputed {new_value}"
                    )));
                }
            }

            let improved = match stored {
                AnswerValue::Finite(old) => old > new_value,
                AnswerValue::Infinite | AnswerValue::Unknown => true,
            };
            if !improved {
                // Same value as before: just take the row off the queue.
                self.graph.hops.set_mark(row_id, DeathMark::Normal);
                return Ok(());
            }

            debug!(%question, distance = new_value, "updating cached distance");
            self.graph
                .hops
                .update(row_id, Distance::Finite(new_value), DeathMark::Normal);

            if self.method != TrackingMethod::NeverDelete {
                self.rewrite_dependencies(row_id, &answer);
            }

            // The improvement may unlock ancestors: requeue them with this
            // answer as their incoming estimate.
            let targets = self.graph.links.document_unique_parents(&question.node);
            add_to_processing_queue(
                &mut *self.graph,
                std::slice::from_ref(&question.link_type),
                &targets,
                std::slice::from_ref(&answer),
                &question.node,
                &question.link_type,
                self.method,
                &self.limits,
            );
            return Ok(());
        }

        // No backing row.  Infinity is represented by continued absence;
        // anything finite gets a fresh row plus its dependency set.
        let AnswerValue::Finite(new_value) = value else {
            return Ok(());
        };
        debug!(%question, distance = new_value, "inserting cached distance");
        let row_id = self.graph.hops.insert(
            question.node.clone(),
            question.link_type.clone(),
            Distance::Finite(new_value),
            DeathMark::Normal,
        );
        if self.method != TrackingMethod::NeverDelete {
            for dep in answer.deps() {
                self.graph.deps.write_dependency(row_id, dep.clone());
            }
        }
        Ok(())
    }

    /// Reconcile an owner's persisted dependency rows with the new answer.
    /// Individual deltas when the sets mostly agree; wholesale replacement
    /// when more than half would change anyway.
    fn rewrite_dependencies(&mut self, row_id: RowId, answer: &Answer) {
        let mut existing: AHashSet<_> = self
            .graph
            .deps
            .deps_for_owner(row_id)
            .into_iter()
            .collect();

        let removals = existing.iter().filter(|d| !answer.has_dep(d)).count();
        let additions = answer.deps().filter(|d| !existing.contains(*d)).count();
        if removals + additions > 1 + answer.dep_count() {
            self.graph.deps.delete_owner_rows([row_id]);
            existing.clear();
        }

        for dep in &existing {
            if !answer.has_dep(dep) {
                self.graph.deps.delete_dependency(row_id, dep);
            }
        }
        for dep in answer.deps() {
            if !existing.contains(dep) {
                self.graph.deps.write_dependency(row_id, dep.clone());
            }
        }
    }
}
