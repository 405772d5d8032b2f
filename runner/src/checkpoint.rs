use crate::status::RecordMap;
use std::{fs, io::Write, path::PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to serialize records")]
    Serialize(#[from] serde_yaml::Error),
    #[error("failed to write checkpoint")]
    Io(#[from] std::io::Error),
}

/// Persists the full records map after every polling round.
///
/// Writes go to a sibling temp file first and land via rename, so a crash
/// mid-write leaves the previous checkpoint intact. The orchestrator never
/// reads the file back; it exists for external reporting.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, records: &RecordMap) -> Result<(), CheckpointError> {
        let payload = serde_yaml::to_string(records)?;
        let staged = self.path.with_extension("tmp");

        {
            let mut file = fs::File::create(&staged)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&staged, &self.path)?;

        debug!(path = ?self.path, records = records.len(), "checkpoint written");

        Ok(())
    }

    /// read a snapshot back; used by reporting collaborators, not by a live
    /// campaign
    pub fn load(path: &PathBuf) -> Result<RecordMap, CheckpointError> {
        let file = fs::File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }
}
