//! Claiming a pending request and releasing the claim afterwards.
//!
//! Ownership of a request is the existence of `<id>.processing`, obtained by
//! renaming `<id>.json`. The rename is the only cross-process coordination the
//! spool has: when two instances race for the same file, exactly one rename
//! finds the source and the other gets `NotFound`.
//!
//! On filesystems where rename is not atomic (some network mounts) this
//! guarantee does not hold and only a single daemon instance may be run
//! against the directory pair.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, trace, warn};

use super::protocol::{claim_path, request_path};

/// Exclusive ownership of one request identity.
///
/// Dropping the claim removes the marker, so every exit path of the code
/// holding it (success, failure, early return, unwinding) cleans up. Only a
/// process crash can leave a marker behind; those are handled by the orphan
/// sweep.
#[derive(Debug)]
pub struct Claim {
    id: String,
    marker: PathBuf,
    released: bool,
}

impl Claim {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the `.processing` marker holding the request body.
    pub fn path(&self) -> &Path {
        &self.marker
    }

    /// Remove the marker now. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            release_marker(&self.marker);
            self.released = true;
        }
    }

    /// Give up ownership without deleting the marker (it has been moved
    /// elsewhere by the caller).
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.release();
    }
}

/// Try to take ownership of `<request_dir>/<id>.json`.
///
/// Returns `None` when the request is gone (another instance or the producer
/// got there first) or cannot be renamed. Losing the race is the normal case
/// with several instances and is not reported as an error.
pub fn try_claim(request_dir: &Path, id: &str) -> Option<Claim> {
    let source = request_path(request_dir, id);
    let marker = claim_path(request_dir, id);

    // rename(2) replaces an existing destination; never clobber a live claim.
    if marker.exists() {
        if source.exists() {
            warn!(
                id = %id,
                "request identity is already claimed; leaving resubmission pending"
            );
        } else {
            trace!(id = %id, "request already claimed");
        }
        return None;
    }

    // rename(2) keeps the producer's mtime. Refresh it first so the marker is
    // never visible with an age that an orphan sweep would call stale.
    touch(&source);
    match fs::rename(&source, &marker) {
        Ok(()) => {
            debug!(id = %id, "claimed request");
            Some(Claim {
                id: id.to_string(),
                marker,
                released: false,
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            trace!(id = %id, "request already claimed or removed");
            None
        }
        Err(e) => {
            debug!(id = %id, error = %e, "claim rename failed; skipping");
            None
        }
    }
}

/// Delete a claim marker if it still exists.
///
/// Returns `true` when a file was removed. Failures are logged and swallowed;
/// a marker that cannot be removed lingers until the orphan sweep finds it.
pub fn release_marker(marker: &Path) -> bool {
    match fs::remove_file(marker) {
        Ok(()) => {
            trace!(path = %marker.display(), "released claim marker");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %marker.display(), error = %e, "failed to remove claim marker");
            false
        }
    }
}

/// Reset the mtime of a request about to be claimed so staleness is measured
/// from the claim.
fn touch(request: &Path) {
    let result = fs::File::options()
        .write(true)
        .open(request)
        .and_then(|f| f.set_modified(SystemTime::now()));
    match result {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!(path = %request.display(), error = %e, "could not refresh claim mtime"),
    }
}
