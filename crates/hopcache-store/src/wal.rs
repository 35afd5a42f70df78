//! Write-ahead command log.
//!
//! Mutating operations append their logical command after the in-memory
//! apply succeeds; recovery replays the log over the last checkpoint
//! snapshot.  Records are length-prefixed bincode frames.
//!
//! Replaying commands (rather than row-level redo) is sound here because the
//! cache's core invariant makes re-execution always safe: a row that is
//! absent or queued is treated as unknown, so the worst a replay can do is
//! redundant recomputation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::command::Command;
use crate::{Result, StoreError};

#[derive(Debug)]
pub struct WriteAheadLog {
    file: Mutex<File>,
    path: PathBuf,
    fsync: bool,
}

impl WriteAheadLog {
    pub fn open(path: &Path, fsync: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one committed command.
    pub fn append(&self, command: &Command) -> Result<()> {
        let mut file = self.file.lock();
        let data = bincode::serialize(command)?;
        let len = data.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&data)?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Replay every complete record in order.  A torn frame at the tail is
    /// an append interrupted by a crash: everything before it is intact, so
    /// the tail is simply ignored.
    pub fn replay(&self, mut handler: impl FnMut(Command) -> Result<()>) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        loop {
            let mut len_bytes = [0u8; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StoreError::Io(e)),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match file.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(path = %self.path.display(), "ignoring torn record at log tail");
                    break;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }

            let command: Command = bincode::deserialize(&data)?;
            handler(command)?;
        }

        // Leave the cursor where appends expect it.
        file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Drop all records after a checkpoint made them redundant.
    pub fn truncate(&self) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}
