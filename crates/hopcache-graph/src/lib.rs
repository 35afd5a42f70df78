//! Hopcache: incremental hop-distance maintenance for crawl link graphs
//!
//! A crawl job discovers directed references between documents.  A hop-count
//! filter needs to know, cheaply, how many type-matching hops separate any
//! document from the seed set.  Recomputing shortest paths on every graph
//! change is out of the question for graphs of crawl size, so this crate
//! maintains a persisted distance cache incrementally:
//!
//! 1. **Intrinsic link table** ([`LinkTable`]): the raw directed edges, with a
//!    three-state provenance tag used to sweep edges not reconfirmed during a
//!    re-scan pass.
//! 2. **Hop-distance cache** ([`HopTable`]): `(node, link type) -> distance`
//!    rows with a transitional death-mark used to coordinate invalidation.
//! 3. **Delete dependencies** ([`DepTable`]): for every cached distance, the
//!    minimal set of edges that justify it, so that removing an edge can
//!    invalidate exactly the rows that relied on it.
//! 4. **Propagation engine** ([`propagation::Resolver`]): a transaction-scoped
//!    worklist solver that recomputes distances for queued cache rows and
//!    writes stable results back.
//!
//! The key invariant throughout: a row that is absent, or whose death-mark is
//! not `Normal`, means "distance unknown / infinite".  That makes a partially
//! completed propagation pass always safe to abandon and re-run.
//!
//! ## Module Organization
//!
//! - `link_table` / `hop_table` / `dep_table`: the three persisted tables
//! - `answer`: the answer-plus-dependencies value model
//! - `propagation`: the worklist resolver
//! - `ops`: the per-job operation layer collaborators call into

pub mod answer;
pub mod dep_table;
pub mod error;
pub mod hop_table;
pub mod link_table;
pub mod ops;
pub mod propagation;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use answer::{Answer, AnswerValue};
pub use dep_table::DepTable;
pub use error::{HopError, Result};
pub use hop_table::{HopRow, HopTable};
pub use link_table::{LinkRow, LinkTable};
pub use ops::JobOps;
pub use propagation::Resolver;

// ============================================================================
// Identifiers
// ============================================================================

/// Job identifier.  Every table row is namespaced by the job it belongs to;
/// distances for different jobs never interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Row identifier within one job's tables.  Small enough to live in roaring
/// bitmaps, which the table indexes use as posting lists.
pub type RowId = u32;

/// The distinguished root ("seed origin") node: the empty identifier.
/// It is at distance zero by definition and never has a cache row.
pub const ROOT_NODE: &str = "";

/// A `(document, link type)` pair: the unit the cache stores distances for,
/// and the unit of work during propagation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Question {
    /// Document identifier hash.
    pub node: String,
    /// The link type whose hops are being counted.
    pub link_type: String,
}

impl Question {
    pub fn new(node: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            link_type: link_type.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.node.is_empty()
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'/'{}'", self.node, self.link_type)
    }
}

// ============================================================================
// Persisted enums
// ============================================================================

/// Persisted distance value.  The infinite sentinel is storable: the insertion
/// path records it for brand-new targets whose source is itself unreachable,
/// and the invalidation sweep writes it while rows await re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    Finite(u32),
    Infinite,
}

impl Distance {
    pub fn is_finite(self) -> bool {
        matches!(self, Distance::Finite(_))
    }

    pub fn finite(self) -> Option<u32> {
        match self {
            Distance::Finite(v) => Some(v),
            Distance::Infinite => None,
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distance::Finite(v) => write!(f, "{v}"),
            Distance::Infinite => write!(f, "inf"),
        }
    }
}

/// Death-mark state of a cache row.  Only `Normal` rows hold trustworthy
/// values; `Queued` rows await recomputation and `Deleting` is a transitional
/// state used mid-way through a bulk invalidation sweep.
///
/// Persisted as its single-character code so that a corrupted store surfaces
/// as [`HopError::BadDeathMark`] instead of silently defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeathMark {
    Normal,
    Queued,
    Deleting,
}

impl DeathMark {
    pub fn as_code(self) -> char {
        match self {
            DeathMark::Normal => 'N',
            DeathMark::Queued => 'Q',
            DeathMark::Deleting => 'D',
        }
    }

    pub fn from_code(code: char) -> Result<Self> {
        match code {
            'N' => Ok(DeathMark::Normal),
            'Q' => Ok(DeathMark::Queued),
            'D' => Ok(DeathMark::Deleting),
            other => Err(HopError::BadDeathMark(other)),
        }
    }
}

impl Serialize for DeathMark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_char(self.as_code())
    }
}

impl<'de> Deserialize<'de> for DeathMark {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = char::deserialize(deserializer)?;
        DeathMark::from_code(code).map_err(serde::de::Error::custom)
    }
}

/// Provenance state of an intrinsic link.  `Base` edges predate the current
/// scan pass; `New` edges were first seen during it; `Confirmed` edges existed
/// before and were seen again.  At pass end, unconfirmed `Base` edges are
/// swept and the rest collapse back to `Base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Base,
    New,
    Confirmed,
}

impl LinkState {
    pub fn as_code(self) -> char {
        match self {
            LinkState::Base => 'B',
            LinkState::New => 'N',
            LinkState::Confirmed => 'E',
        }
    }

    pub fn from_code(code: char) -> Result<Self> {
        match code {
            'B' => Ok(LinkState::Base),
            'N' => Ok(LinkState::New),
            'E' => Ok(LinkState::Confirmed),
            other => Err(HopError::BadLinkState(other)),
        }
    }
}

impl Serialize for LinkState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_char(self.as_code())
    }
}

impl<'de> Deserialize<'de> for LinkState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = char::deserialize(deserializer)?;
        LinkState::from_code(code).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Dependencies and job configuration
// ============================================================================

/// One edge that a cached distance relies on.  Removing any edge listed for a
/// row means the row's distance can no longer be trusted and must be
/// re-evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteDependency {
    pub link_type: String,
    /// The document the edge points at (the node whose distance may improve).
    pub target: String,
    /// The document the edge came from (the node supplying the estimate).
    pub source: String,
}

impl DeleteDependency {
    pub fn new(
        link_type: impl Into<String>,
        target: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            link_type: link_type.into(),
            target: target.into(),
            source: source.into(),
        }
    }
}

/// Per-job hop-count accounting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingMethod {
    /// Full dependency bookkeeping; edge and document removals invalidate
    /// exactly the affected cache rows.
    Accurate,
    /// Dependencies are recorded but deletion sweeps are skipped.  Cheaper
    /// when the repository only ever grows.
    NoDelete,
    /// No dependency rows are written or consulted at all.
    NeverDelete,
}

/// Batch sizing supplied by the storage layer.  `max_in_terms` is the
/// backend's maximum predicate count; every bulk existence check, sweep and
/// child fetch is chunked to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_in_terms: usize,
    /// How many queued rows one `process_queue` call pulls.
    pub queue_batch: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_in_terms: 25,
            queue_batch: 200,
        }
    }
}

impl BatchLimits {
    /// Split a batch into backend-sized chunks.
    pub fn chunks<'a, T>(&self, items: &'a [T]) -> impl Iterator<Item = &'a [T]> {
        items.chunks(self.max_in_terms.max(1))
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation handle.  The propagation loop checks it once per
/// iteration and aborts with [`HopError::Interrupted`], leaving affected rows
/// in their last-committed state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// One job's tables
// ============================================================================

/// The three tables for a single job.  The storage layer keeps one of these
/// per job and hands out exclusive access for the duration of a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobGraph {
    pub links: LinkTable,
    pub hops: HopTable,
    pub deps: DepTable,
}
