//! Producer side of the spool.
//!
//! Requests are staged as `<id>.json.tmp` and renamed into place so the
//! daemon never sees a half-written file; the daemon still tolerates
//! producers that create `<id>.json` empty and fill it shortly after.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::protocol::{
    InferOptions, REQUEST_EXT, RequestBody, SpoolResponse, TEMP_EXT, request_path, response_path,
};

/// Default time a producer waits for its response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const RESPONSE_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid request id '{0}'")]
    InvalidId(String),

    #[error("request {0} is already pending")]
    Duplicate(String),

    #[error("no response for {id} within {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unreadable response for {id}: {reason}")]
    BadResponse { id: String, reason: String },

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> ClientError + 'a {
    move |source| ClientError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Submits requests and collects responses for one directory pair.
#[derive(Debug, Clone)]
pub struct SpoolClient {
    request_dir: PathBuf,
    response_dir: PathBuf,
    poll: Duration,
}

impl SpoolClient {
    pub fn new(request_dir: impl Into<PathBuf>, response_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_dir: request_dir.into(),
            response_dir: response_dir.into(),
            poll: RESPONSE_POLL,
        }
    }

    /// Override how often [`wait`](Self::wait) looks for the response.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Submit under a fresh random id.
    pub fn submit(&self, payload: &[u8], options: InferOptions) -> Result<String, ClientError> {
        let id = new_request_id();
        self.submit_with_id(&id, payload, options)?;
        Ok(id)
    }

    /// Submit under a caller-chosen id.
    pub fn submit_with_id(
        &self,
        id: &str,
        payload: &[u8],
        options: InferOptions,
    ) -> Result<(), ClientError> {
        validate_id(id)?;
        fs::create_dir_all(&self.request_dir)
            .map_err(io_err("create request dir", &self.request_dir))?;

        let dest = request_path(&self.request_dir, id);
        if dest.exists() {
            return Err(ClientError::Duplicate(id.to_string()));
        }
        // A response left over from an earlier use of this id would be
        // mistaken for ours.
        let _ = fs::remove_file(response_path(&self.response_dir, id));

        let body = serde_json::to_vec(&RequestBody::new(payload, options))?;

        let staging = self
            .request_dir
            .join(format!("{id}.{REQUEST_EXT}.{TEMP_EXT}"));
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&staging)?;
            file.write_all(&body)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&staging);
            return Err(io_err("write request", &staging)(e));
        }
        if let Err(e) = fs::rename(&staging, &dest) {
            let _ = fs::remove_file(&staging);
            return Err(io_err("submit request", &dest)(e));
        }

        debug!(id = %id, bytes = body.len(), "submitted request");
        Ok(())
    }

    /// Wait for the response to `id` and consume it.
    ///
    /// On timeout the request is withdrawn if no daemon has claimed it yet.
    pub fn wait(&self, id: &str, timeout: Duration) -> Result<SpoolResponse, ClientError> {
        let path = response_path(&self.response_dir, id);
        let deadline = Instant::now() + timeout;

        loop {
            match fs::read(&path) {
                Ok(bytes) => {
                    let parsed = serde_json::from_slice::<SpoolResponse>(&bytes);
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(id = %id, error = %e, "failed to remove consumed response");
                    }
                    return parsed.map_err(|e| ClientError::BadResponse {
                        id: id.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err("read response", &path)(e)),
            }

            if Instant::now() >= deadline {
                self.withdraw(id);
                return Err(ClientError::Timeout {
                    id: id.to_string(),
                    timeout,
                });
            }
            std::thread::sleep(self.poll.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Submit and wait in one step.
    pub fn call(
        &self,
        payload: &[u8],
        options: InferOptions,
        timeout: Duration,
    ) -> Result<SpoolResponse, ClientError> {
        let id = self.submit(payload, options)?;
        self.wait(&id, timeout)
    }

    fn withdraw(&self, id: &str) {
        match fs::remove_file(request_path(&self.request_dir, id)) {
            Ok(()) => debug!(id = %id, "withdrew unclaimed request"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(id = %id, error = %e, "failed to withdraw request"),
        }
    }
}

/// 128 random bits as lowercase hex.
pub fn new_request_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>())
}

/// Ids become file stems: keep them to a safe, unambiguous alphabet.
fn validate_id(id: &str) -> Result<(), ClientError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.ends_with(".processing")
        && !id.ends_with(".tmp");
    if ok {
        Ok(())
    } else {
        Err(ClientError::InvalidId(id.to_string()))
    }
}
