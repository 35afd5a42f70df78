//! Hopcache storage layer.
//!
//! [`GraphStore`] owns every job's tables and surfaces the operations the
//! crawler framework calls: reference recording, scan-pass completion,
//! document removal, queue processing and best-effort distance reads.
//!
//! ## Transactions
//!
//! Every mutating operation runs as a job-scoped transaction: the job's
//! tables are snapshotted at begin, mutated in place, and restored wholesale
//! on any error.  Commit appends the logical command to a write-ahead log.
//! The store-level write lock gives single-writer discipline per store;
//! reads that guard subsequent writes (the queued-batch pull, the
//! record-references existence check) therefore execute with the same
//! protection a row-level read-for-update would give, while `find_hop_counts`
//! deliberately runs outside any transaction; whatever comes back is a safe
//! upper bound.
//!
//! ## Crash safety
//!
//! Recovery loads the last checkpoint snapshot and replays the command log.
//! A crash mid-operation loses only the unlogged command; affected rows stay
//! in their last-committed state, which is always safe to resume from
//! because absent-or-queued rows are treated as unknown.  [`GraphStore::checkpoint`]
//! writes a fresh snapshot (temp file + atomic rename) and truncates the log.

pub mod command;
pub mod snapshot;
pub mod wal;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use hopcache_graph::{
    BatchLimits, CancelToken, Distance, HopError, JobGraph, JobId, JobOps, TrackingMethod,
};

pub use command::Command;
pub use wal::WriteAheadLog;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// Engine-level failure (consistency violation, malformed code,
    /// interruption).  Propagated unchanged.
    #[error(transparent)]
    Hop(#[from] HopError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("manifest failure: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A persisted file is not what it claims to be.
    #[error("{0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Configuration
// ============================================================================

const STORE_FORMAT_VERSION: u32 = 1;

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the snapshot, command log and manifest.
    pub data_dir: PathBuf,
    /// Backend maximum predicate count; bulk operations chunk to this.
    pub max_in_terms: usize,
    /// How many queued rows one `process_queue` call pulls.
    pub queue_batch: usize,
    /// Sync appends and snapshots to disk.  Turning this off trades crash
    /// durability for speed; useful for tests and bulk loads.
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./hopcache"),
            max_in_terms: 25,
            queue_batch: 200,
            fsync: true,
        }
    }
}

impl StoreConfig {
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_in_terms: self.max_in_terms,
            queue_batch: self.queue_batch,
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("hopcache.snap")
    }

    fn wal_path(&self) -> PathBuf {
        self.data_dir.join("hopcache.wal")
    }

    fn manifest_path(&self) -> PathBuf {
        self.data_dir.join("manifest.json")
    }
}

/// Small human-readable marker identifying the on-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
}

// ============================================================================
// The store
// ============================================================================

enum Undo {
    Job(JobId, Option<JobGraph>),
    All(HashMap<JobId, JobGraph>),
}

impl Undo {
    fn restore(self, jobs: &mut HashMap<JobId, JobGraph>) {
        match self {
            Undo::Job(job, Some(graph)) => {
                jobs.insert(job, graph);
            }
            Undo::Job(job, None) => {
                jobs.remove(&job);
            }
            Undo::All(saved) => {
                *jobs = saved;
            }
        }
    }
}

/// Command outcomes; shape depends on the command.
enum Outcome {
    Unit,
    Flags(Vec<bool>),
    Drained(bool),
}

#[derive(Debug)]
pub struct GraphStore {
    config: StoreConfig,
    jobs: RwLock<HashMap<JobId, JobGraph>>,
    wal: WriteAheadLog,
    cancel: CancelToken,
}

impl GraphStore {
    /// Open (or create) a store in the configured data directory, recovering
    /// state from the last snapshot plus the command log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Self::check_manifest(&config.manifest_path())?;

        let jobs = snapshot::load(&config.snapshot_path())?.unwrap_or_default();
        let wal = WriteAheadLog::open(&config.wal_path(), config.fsync)?;

        let store = Self {
            config,
            jobs: RwLock::new(jobs),
            wal,
            cancel: CancelToken::new(),
        };
        store.recover()?;
        Ok(store)
    }

    fn check_manifest(path: &Path) -> Result<()> {
        if path.exists() {
            let manifest: Manifest = serde_json::from_str(&fs::read_to_string(path)?)?;
            if manifest.format_version != STORE_FORMAT_VERSION {
                return Err(StoreError::Format(format!(
                    "store format version {} is not supported (expected {})",
                    manifest.format_version, STORE_FORMAT_VERSION
                )));
            }
        } else {
            let manifest = Manifest {
                format_version: STORE_FORMAT_VERSION,
            };
            fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let limits = self.config.batch_limits();
        let mut jobs = self.jobs.write();
        let mut replayed = 0usize;
        self.wal.replay(|command| {
            apply_command(&mut jobs, &command, &limits, &self.cancel)?;
            replayed += 1;
            Ok(())
        })?;
        if replayed > 0 {
            info!(replayed, "recovered logged commands over last snapshot");
        }
        Ok(())
    }

    /// Write a fresh snapshot and truncate the command log.
    pub fn checkpoint(&self) -> Result<()> {
        let jobs = self.jobs.read();
        snapshot::save(&self.config.snapshot_path(), &jobs, self.config.fsync)?;
        self.wal.truncate()?;
        debug!(jobs = jobs.len(), "checkpoint written");
        Ok(())
    }

    /// Handle for cooperatively interrupting an in-flight propagation pass.
    /// A cancelled pass rolls back to the last commit and stays resumable.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run a command as a transaction: apply in memory, log on success,
    /// restore the prior state on any failure (including a failed append).
    fn execute(&self, command: Command) -> Result<Outcome> {
        let mut jobs = self.jobs.write();
        let undo = match command.job() {
            Some(job) => Undo::Job(job, jobs.get(&job).cloned()),
            None => Undo::All(jobs.clone()),
        };
        match apply_command(&mut jobs, &command, &self.config.batch_limits(), &self.cancel) {
            Ok(outcome) => match self.wal.append(&command) {
                Ok(()) => Ok(outcome),
                Err(e) => {
                    undo.restore(&mut jobs);
                    Err(e)
                }
            },
            Err(e) => {
                undo.restore(&mut jobs);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Facade operations
    // ========================================================================

    /// Record a reference from `source` to a single target document.
    #[allow(clippy::too_many_arguments)]
    pub fn record_reference(
        &self,
        job: JobId,
        legal_link_types: &[String],
        source: &str,
        target: &str,
        link_type: &str,
        method: TrackingMethod,
        process_id: &str,
    ) -> Result<bool> {
        let flags = self.record_references(
            job,
            legal_link_types,
            source,
            &[target.to_string()],
            link_type,
            method,
            process_id,
        )?;
        Ok(flags[0])
    }

    /// Record references from `source` to `targets`.  Returns, per target,
    /// whether its cached distance may have changed.
    #[allow(clippy::too_many_arguments)]
    pub fn record_references(
        &self,
        job: JobId,
        legal_link_types: &[String],
        source: &str,
        targets: &[String],
        link_type: &str,
        method: TrackingMethod,
        process_id: &str,
    ) -> Result<Vec<bool>> {
        let outcome = self.execute(Command::RecordReferences {
            job,
            legal_link_types: legal_link_types.to_vec(),
            source: source.to_string(),
            targets: targets.to_vec(),
            link_type: link_type.to_string(),
            method,
            process_id: process_id.to_string(),
        })?;
        match outcome {
            Outcome::Flags(flags) => Ok(flags),
            _ => unreachable!("record commands yield flags"),
        }
    }

    /// Record references from the root to the seed documents.
    pub fn record_seed_references(
        &self,
        job: JobId,
        legal_link_types: &[String],
        targets: &[String],
        method: TrackingMethod,
        process_id: &str,
    ) -> Result<Vec<bool>> {
        let outcome = self.execute(Command::RecordSeedReferences {
            job,
            legal_link_types: legal_link_types.to_vec(),
            targets: targets.to_vec(),
            method,
            process_id: process_id.to_string(),
        })?;
        match outcome {
            Outcome::Flags(flags) => Ok(flags),
            _ => unreachable!("record commands yield flags"),
        }
    }

    /// Complete a recalculation pass for a set of source documents.
    pub fn finish_parents(
        &self,
        job: JobId,
        legal_link_types: &[String],
        sources: &[String],
        method: TrackingMethod,
    ) -> Result<()> {
        self.execute(Command::FinishParents {
            job,
            legal_link_types: legal_link_types.to_vec(),
            sources: sources.to_vec(),
            method,
        })?;
        Ok(())
    }

    /// Complete the seed-recording pass.
    pub fn finish_seed_references(
        &self,
        job: JobId,
        legal_link_types: &[String],
        method: TrackingMethod,
    ) -> Result<()> {
        self.execute(Command::FinishSeedReferences {
            job,
            legal_link_types: legal_link_types.to_vec(),
            method,
        })?;
        Ok(())
    }

    /// Throw away links recorded during aborted document processing.
    pub fn revert_parents(&self, job: JobId, sources: &[String]) -> Result<()> {
        self.execute(Command::RevertParents {
            job,
            sources: sources.to_vec(),
        })?;
        Ok(())
    }

    /// Remove documents by identifier, invalidating every cached distance
    /// that depended on one of their outgoing links.
    pub fn delete_document_identifiers(
        &self,
        job: JobId,
        legal_link_types: &[String],
        documents: &[String],
        method: TrackingMethod,
    ) -> Result<()> {
        self.execute(Command::DeleteDocuments {
            job,
            legal_link_types: legal_link_types.to_vec(),
            documents: documents.to_vec(),
            method,
        })?;
        Ok(())
    }

    /// Remove every document whose identifier satisfies `criteria`.  The
    /// criterion is resolved to a concrete identifier list first so the
    /// logged command is replayable; the resolved list is returned.
    pub fn delete_matching_documents(
        &self,
        job: JobId,
        legal_link_types: &[String],
        method: TrackingMethod,
        criteria: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let documents = {
            let jobs = self.jobs.read();
            jobs.get(&job)
                .map(|graph| graph.links.sources_matching(&criteria))
                .unwrap_or_default()
        };
        if !documents.is_empty() {
            self.delete_document_identifiers(job, legal_link_types, &documents, method)?;
        }
        Ok(documents)
    }

    /// Pull one bounded batch of queued rows through the propagation engine.
    /// Returns whether the queue is now empty.
    pub fn process_queue(
        &self,
        job: JobId,
        legal_link_types: &[String],
        method: TrackingMethod,
    ) -> Result<bool> {
        let outcome = self.execute(Command::ProcessQueue {
            job,
            legal_link_types: legal_link_types.to_vec(),
            method,
        })?;
        match outcome {
            Outcome::Drained(drained) => Ok(drained),
            _ => unreachable!("process-queue commands yield drained"),
        }
    }

    /// Best-effort cached distances.  No transaction: whatever comes back is
    /// only ever an upper bound unless the queue has been drained, and the
    /// infinite sentinel stands in for absent rows.
    pub fn find_hop_counts(&self, job: JobId, nodes: &[String], link_type: &str) -> Vec<Distance> {
        let jobs = self.jobs.read();
        match jobs.get(&job) {
            Some(graph) => graph
                .hops
                .distances(nodes, link_type, &self.config.batch_limits()),
            None => vec![Distance::Infinite; nodes.len()],
        }
    }

    /// Drop every table row belonging to a job.
    pub fn delete_job(&self, job: JobId) -> Result<()> {
        self.execute(Command::DeleteJob { job })?;
        Ok(())
    }

    /// Startup reset for one crashed process.
    pub fn restart(&self, process_id: &str) -> Result<()> {
        self.execute(Command::Restart {
            process_id: Some(process_id.to_string()),
        })?;
        Ok(())
    }

    /// Startup reset across all process IDs.
    pub fn restart_all(&self) -> Result<()> {
        self.execute(Command::Restart { process_id: None })?;
        Ok(())
    }

    /// Cluster-wide restart hook.  Nothing beyond the per-process resets is
    /// required today; the command is still logged for operational audit.
    pub fn restart_cluster(&self) -> Result<()> {
        self.execute(Command::RestartCluster)?;
        Ok(())
    }

    /// Read-only view of one job's tables, for diagnostics and tests.
    pub fn with_job<R>(&self, job: JobId, f: impl FnOnce(&JobGraph) -> R) -> Option<R> {
        let jobs = self.jobs.read();
        jobs.get(&job).map(f)
    }
}

// ============================================================================
// Command application (shared by live execution and replay)
// ============================================================================

fn apply_command(
    jobs: &mut HashMap<JobId, JobGraph>,
    command: &Command,
    limits: &BatchLimits,
    cancel: &CancelToken,
) -> Result<Outcome> {
    match command {
        Command::RecordReferences {
            job,
            legal_link_types,
            source,
            targets,
            link_type,
            method,
            process_id,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            let flags = ops.record_references(source, targets, link_type, process_id)?;
            Ok(Outcome::Flags(flags))
        }
        Command::RecordSeedReferences {
            job,
            legal_link_types,
            targets,
            method,
            process_id,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            let flags = ops.record_seed_references(targets, process_id)?;
            Ok(Outcome::Flags(flags))
        }
        Command::FinishParents {
            job,
            legal_link_types,
            sources,
            method,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            ops.finish_parents(sources)?;
            Ok(Outcome::Unit)
        }
        Command::FinishSeedReferences {
            job,
            legal_link_types,
            method,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            ops.finish_seed_references()?;
            Ok(Outcome::Unit)
        }
        Command::RevertParents { job, sources } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, &[], TrackingMethod::Accurate, limits.clone(), cancel);
            ops.revert_parents(sources)?;
            Ok(Outcome::Unit)
        }
        Command::DeleteDocuments {
            job,
            legal_link_types,
            documents,
            method,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            ops.delete_document_identifiers(documents)?;
            Ok(Outcome::Unit)
        }
        Command::ProcessQueue {
            job,
            legal_link_types,
            method,
        } => {
            let graph = jobs.entry(*job).or_default();
            let mut ops = JobOps::new(graph, legal_link_types, *method, limits.clone(), cancel);
            let drained = ops.process_queue()?;
            Ok(Outcome::Drained(drained))
        }
        Command::DeleteJob { job } => {
            jobs.remove(job);
            Ok(Outcome::Unit)
        }
        Command::Restart { process_id } => {
            for graph in jobs.values_mut() {
                let mut ops =
                    JobOps::new(graph, &[], TrackingMethod::Accurate, limits.clone(), cancel);
                ops.restart(process_id.as_deref())?;
            }
            Ok(Outcome::Unit)
        }
        Command::RestartCluster => {
            debug!("cluster restart: per-process resets cover everything needed");
            Ok(Outcome::Unit)
        }
    }
}
