//! Atomic publication of responses.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::{SpoolError, SpoolResult};
use super::protocol::{SpoolResponse, response_path, response_temp_path};

/// Publishes responses into the response directory.
///
/// A response is staged in `<id>.tmp`, fsynced, then renamed to `<id>.json`,
/// so a reader listing the directory sees either nothing or the full file.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    response_dir: PathBuf,
}

impl ResponseWriter {
    pub fn new(response_dir: impl Into<PathBuf>) -> Self {
        Self {
            response_dir: response_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.response_dir
    }

    /// Publish `response` under `id`, replacing any previous file.
    pub fn publish(&self, id: &str, response: &SpoolResponse) -> SpoolResult<PathBuf> {
        let bytes = serde_json::to_vec(response).map_err(|source| SpoolError::Serialize {
            id: id.to_string(),
            source,
        })?;
        self.publish_bytes(id, &bytes)
    }

    /// Publish an already-serialized body.
    pub fn publish_bytes(&self, id: &str, bytes: &[u8]) -> SpoolResult<PathBuf> {
        // Recreated on every write: the directory may have been removed since startup.
        fs::create_dir_all(&self.response_dir)
            .map_err(|e| SpoolError::io("create response dir", &self.response_dir, e))?;

        let temp = response_temp_path(&self.response_dir, id);
        let dest = response_path(&self.response_dir, id);

        if let Err(e) = write_synced(&temp, bytes) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, &dest) {
            let _ = fs::remove_file(&temp);
            return Err(SpoolError::io("rename response", &temp, e));
        }
        if let Err(e) = sync_dir(&self.response_dir) {
            debug!(dir = %self.response_dir.display(), error = %e, "response dir fsync failed");
        }

        debug!(id = %id, path = %dest.display(), bytes = bytes.len(), "published response");
        Ok(dest)
    }

    /// Publish, logging instead of failing. Returns whether the response landed.
    pub fn publish_logged(&self, id: &str, response: &SpoolResponse) -> bool {
        match self.publish(id, response) {
            Ok(_) => true,
            Err(e) => {
                warn!(id = %id, error = %e, "failed to publish response");
                false
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> SpoolResult<()> {
    let mut file = File::create(path).map_err(|e| SpoolError::io("create", path, e))?;
    file.write_all(bytes)
        .map_err(|e| SpoolError::io("write", path, e))?;
    file.sync_all()
        .map_err(|e| SpoolError::io("fsync", path, e))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
