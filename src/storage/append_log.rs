//! Streaming JSON-array log file.
//!
//! The file always holds a complete JSON array:
//!
//! ```text
//! [
//!     {"level_name": "a", ...},
//!     {"level_name": "b", ...}
//! ]
//! ```
//!
//! Each append seeks back over the trailing `\n]\n`, writes
//! `<delimiter>\n    <entry>\n]\n` in its place and syncs the file, so the
//! content parses after every single append. One writer per file; nothing
//! here guards against two `AppendLog`s on the same path.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{LogError, Result};

const CLOSER: &[u8] = b"\n]\n";

/// Which delimiter the next entry is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelimiterState {
    /// Fresh file: the next entry opens the array with `[`.
    FirstEntry,
    /// The array already has entries: the next one is preceded by `,`.
    SubsequentEntry,
}

impl DelimiterState {
    fn delimiter(self) -> char {
        match self {
            Self::FirstEntry => '[',
            Self::SubsequentEntry => ',',
        }
    }
}

#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: File,
    len: u64,
    state: DelimiterState,
    appended: u64,
}

impl AppendLog {
    /// Open `path`, creating it if needed.
    ///
    /// An existing non-empty file must end with the array closer; anything
    /// else is rejected rather than repaired.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LogError::storage(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| LogError::storage(&path, e))?
            .len();

        let state = if len == 0 {
            DelimiterState::FirstEntry
        } else {
            check_closer(&mut file, len).map_err(|e| LogError::storage(&path, e))?;
            DelimiterState::SubsequentEntry
        };

        debug!(path = %path.display(), bytes = len, resumed = len > 0, "Opened episode log");
        Ok(Self {
            path,
            file,
            len,
            state,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> DelimiterState {
        self.state
    }

    /// Entries appended through this handle (not counting resumed content).
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Append one JSON value and sync it to disk.
    pub fn append<T: Serialize + ?Sized>(&mut self, entry: &T) -> Result<()> {
        let data = serde_json::to_string(entry).map_err(|e| LogError::Serialization {
            field: "<entry>".into(),
            reason: e.to_string(),
        })?;
        let chunk = format!("{}\n    {}\n]\n", self.state.delimiter(), data);
        let offset = match self.state {
            DelimiterState::FirstEntry => 0,
            DelimiterState::SubsequentEntry => self.len.saturating_sub(CLOSER.len() as u64),
        };

        self.write_at(offset, chunk.as_bytes())
            .map_err(|e| LogError::storage(&self.path, e))?;

        self.len = offset + chunk.len() as u64;
        self.state = DelimiterState::SubsequentEntry;
        self.appended += 1;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        self.file.sync_data()
    }

    /// Sync and release the file handle.
    pub fn close(self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| LogError::storage(&self.path, e))
    }
}

fn check_closer(file: &mut File, len: u64) -> io::Result<()> {
    let closer_len = CLOSER.len() as u64;
    if len < closer_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "existing log is too short to be a JSON array",
        ));
    }
    let mut tail = [0u8; 3];
    file.seek(SeekFrom::Start(len - closer_len))?;
    file.read_exact(&mut tail)?;
    if tail != CLOSER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "existing log does not end with the array closer",
        ));
    }
    Ok(())
}
