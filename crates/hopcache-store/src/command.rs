//! Logical commands: one per mutating facade operation.
//!
//! Commands carry everything needed to re-execute the operation from scratch,
//! including the per-job link type configuration and tracking method, so a
//! replayed log is self-contained.

use serde::{Deserialize, Serialize};

use hopcache_graph::{JobId, TrackingMethod};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    RecordReferences {
        job: JobId,
        legal_link_types: Vec<String>,
        source: String,
        targets: Vec<String>,
        link_type: String,
        method: TrackingMethod,
        process_id: String,
    },
    RecordSeedReferences {
        job: JobId,
        legal_link_types: Vec<String>,
        targets: Vec<String>,
        method: TrackingMethod,
        process_id: String,
    },
    FinishParents {
        job: JobId,
        legal_link_types: Vec<String>,
        sources: Vec<String>,
        method: TrackingMethod,
    },
    FinishSeedReferences {
        job: JobId,
        legal_link_types: Vec<String>,
        method: TrackingMethod,
    },
    RevertParents {
        job: JobId,
        sources: Vec<String>,
    },
    DeleteDocuments {
        job: JobId,
        legal_link_types: Vec<String>,
        documents: Vec<String>,
        method: TrackingMethod,
    },
    ProcessQueue {
        job: JobId,
        legal_link_types: Vec<String>,
        method: TrackingMethod,
    },
    DeleteJob {
        job: JobId,
    },
    Restart {
        /// `None` cleans up after every process.
        process_id: Option<String>,
    },
    RestartCluster,
}

impl Command {
    /// The job a command is scoped to; `None` for store-wide recovery hooks.
    pub fn job(&self) -> Option<JobId> {
        match self {
            Command::RecordReferences { job, .. }
            | Command::RecordSeedReferences { job, .. }
            | Command::FinishParents { job, .. }
            | Command::FinishSeedReferences { job, .. }
            | Command::RevertParents { job, .. }
            | Command::DeleteDocuments { job, .. }
            | Command::ProcessQueue { job, .. }
            | Command::DeleteJob { job } => Some(*job),
            Command::Restart { .. } | Command::RestartCluster => None,
        }
    }
}
