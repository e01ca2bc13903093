//! Durable record of every committed round.
//!
//! Each round is a single json file named after its zero padded round id.
//! Files are written to a temporary sibling, synced, and renamed into place,
//! so readers either see a whole record or none at all.

use std::{
    error::Error,
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use model::{ClientId, ClientUpdate, ModelState, RoundId};
use serde::{Deserialize, Serialize};

const PREFIX: &str = "round-";
const SUFFIX: &str = ".json";

/// Persistence failures, fatal to the session.
#[derive(Debug)]
pub enum CheckpointErr {
    Io { path: PathBuf, source: io::Error },
    Serde { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io { path, source } => {
                write!(f, "io error on '{}': {source}", path.display())
            }
            CheckpointErr::Serde { path, source } => {
                write!(f, "malformed checkpoint '{}': {source}", path.display())
            }
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io { source, .. } => Some(source),
            CheckpointErr::Serde { source, .. } => Some(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// What is persisted for a committed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub server_id: String,
    pub round_id: RoundId,
    /// Which attempt of the round committed, starting at 0.
    pub attempt: u32,
    /// The model produced by the round.
    pub model: ModelState,
    pub selected: Vec<ClientId>,
    pub responded: Vec<ClientId>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<ClientUpdate>>,
}

/// A directory of round records.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep_last: usize,
}

impl CheckpointStore {
    /// Opens the store at `dir`, creating the directory if needed.
    ///
    /// # Arguments
    /// * `dir` - Where the records live.
    /// * `keep_last` - How many records to keep after a save, 0 keeps all of them.
    pub fn open(dir: impl Into<PathBuf>, keep_last: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointErr::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(Self { dir, keep_last })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically persists `record`, then prunes the oldest records.
    ///
    /// # Returns
    /// The path of the written record.
    pub fn save_round(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        let path = self.dir.join(file_name(record.round_id));
        let tmp = self.dir.join(format!(".{}.tmp", file_name(record.round_id)));

        let bytes = serde_json::to_vec(record).map_err(|source| CheckpointErr::Serde {
            path: path.clone(),
            source,
        })?;

        write_synced(&tmp, &bytes).map_err(|source| CheckpointErr::Io {
            path: tmp.clone(),
            source,
        })?;

        fs::rename(&tmp, &path).map_err(|source| CheckpointErr::Io {
            path: path.clone(),
            source,
        })?;

        // Makes the rename itself durable, not supported everywhere.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        debug!(round_id = record.round_id; "checkpoint written to {}", path.display());
        self.prune()?;
        Ok(path)
    }

    /// Loads the record of the highest committed round, if any.
    pub fn load_latest(&self) -> Result<Option<CheckpointRecord>> {
        let Some((_, path)) = self.rounds()?.pop() else {
            return Ok(None);
        };

        let bytes = fs::read(&path).map_err(|source| CheckpointErr::Io {
            path: path.clone(),
            source,
        })?;

        let record = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointErr::Serde { path, source })?;

        Ok(Some(record))
    }

    /// Every record on disk, in ascending round order.
    fn rounds(&self) -> Result<Vec<(RoundId, PathBuf)>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointErr::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut rounds = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointErr::Io {
                path: self.dir.clone(),
                source,
            })?;

            let name = entry.file_name();
            if let Some(round_id) = name.to_str().and_then(parse_file_name) {
                rounds.push((round_id, entry.path()));
            }
        }

        rounds.sort_unstable_by_key(|(round_id, _)| *round_id);
        Ok(rounds)
    }

    fn prune(&self) -> Result<()> {
        if self.keep_last == 0 {
            return Ok(());
        }

        let rounds = self.rounds()?;
        let excess = rounds.len().saturating_sub(self.keep_last);

        for (round_id, path) in &rounds[..excess] {
            if let Err(e) = fs::remove_file(path) {
                warn!(round_id = *round_id; "couldn't prune old checkpoint: {e}");
            }
        }

        Ok(())
    }
}

fn file_name(round_id: RoundId) -> String {
    format!("{PREFIX}{round_id:010}{SUFFIX}")
}

fn parse_file_name(name: &str) -> Option<RoundId> {
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
