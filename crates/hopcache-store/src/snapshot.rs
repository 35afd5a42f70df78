//! Checkpoint snapshots: the full table state, bincode-encoded behind a
//! magic/version header, written to a temporary file and renamed into place
//! so a crash can never leave a half-written snapshot under the real name.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use hopcache_graph::{JobGraph, JobId};

use crate::{Result, StoreError};

const SNAPSHOT_MAGIC: [u8; 8] = *b"HOPCACHE";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: [u8; 8],
    version: u32,
}

pub fn save(path: &Path, jobs: &HashMap<JobId, JobGraph>, fsync: bool) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        bincode::serialize_into(
            &mut writer,
            &SnapshotHeader {
                magic: SNAPSHOT_MAGIC,
                version: SNAPSHOT_VERSION,
            },
        )?;
        bincode::serialize_into(&mut writer, jobs)?;
        writer.flush()?;
        if fsync {
            writer.get_ref().sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot, or `None` when no checkpoint has been written yet.
pub fn load(path: &Path) -> Result<Option<HashMap<JobId, JobGraph>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = BufReader::new(File::open(path)?);
    let header: SnapshotHeader = bincode::deserialize_from(&mut reader)?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(StoreError::Format(format!(
            "{} is not a hopcache snapshot",
            path.display()
        )));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(StoreError::Format(format!(
            "snapshot version {} is not supported (expected {})",
            header.version, SNAPSHOT_VERSION
        )));
    }
    let jobs = bincode::deserialize_from(&mut reader)?;
    Ok(Some(jobs))
}
