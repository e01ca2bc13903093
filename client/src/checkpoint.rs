use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use model::{ClientId, RoundId};
use serde::{Deserialize, Serialize};

use crate::error::{ClientErr, Result};

/// What a client remembers across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    pub client_id: ClientId,
    /// The last round a result was submitted for.
    pub last_round: Option<RoundId>,
    pub rounds_completed: u64,
}

impl LocalState {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            last_round: None,
            rounds_completed: 0,
        }
    }
}

/// A single json file holding the `LocalState`, replaced atomically.
#[derive(Debug, Clone)]
pub struct LocalCheckpoint {
    path: PathBuf,
}

impl LocalCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored state, `None` if nothing was stored yet.
    pub fn load(&self) -> Result<Option<LocalState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.err(e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| self.err(e.into()))
    }

    /// Replaces the stored state with `state`.
    pub fn save(&self, state: &LocalState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| self.err(e.into()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.err(e))?;
        }

        write_synced(&tmp, &bytes).map_err(|e| self.err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.err(e))
    }

    fn err(&self, source: io::Error) -> ClientErr {
        ClientErr::Checkpoint {
            path: self.path.clone(),
            source,
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = LocalCheckpoint::new(dir.path().join("state.json"));

        assert_eq!(ckpt.load().unwrap(), None);
    }

    #[test]
    fn saved_state_is_loaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = LocalCheckpoint::new(dir.path().join("nested/state.json"));

        let mut state = LocalState::new("a".into());
        ckpt.save(&state).unwrap();

        state.last_round = Some(7);
        state.rounds_completed = 5;
        ckpt.save(&state).unwrap();

        assert_eq!(ckpt.load().unwrap(), Some(state));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{").unwrap();

        let err = LocalCheckpoint::new(path).load().unwrap_err();
        assert!(matches!(err, ClientErr::Checkpoint { .. }));
    }
}
