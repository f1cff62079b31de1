//! Recovery of claims abandoned by a crashed daemon.
//!
//! A daemon that dies between claim and response leaves `<id>.processing`
//! behind, and nobody else will ever touch it because ownership is the
//! marker's existence. The sweep treats markers older than a threshold as
//! orphaned and applies an [`OrphanPolicy`]. The threshold must exceed the
//! longest inference a live instance can take, otherwise a request that is
//! still being worked on may be processed twice. Claiming refreshes the
//! request's mtime before the rename, so a marker never appears carrying the
//! producer's older timestamp.
//!
//! Staging files (`*.tmp`) older than the same threshold are deleted from
//! both directories.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::claim::release_marker;
use super::error::{SpoolError, SpoolResult};
use super::protocol::{SpoolResponse, TEMP_EXT, claim_path, claimed_id, request_path};
use super::writer::ResponseWriter;

/// Error text published for requests failed by the sweep.
pub const ABANDONED_ERROR: &str = "request abandoned by a crashed worker";

/// What to do with an orphaned claim marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Rename the marker back to `<id>.json` so any instance picks it up again.
    #[default]
    Requeue,
    /// Publish a failure response and delete the marker.
    Fail,
    /// Log and leave the marker in place.
    Ignore,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "fail" => Ok(Self::Fail),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!(
                "unknown orphan policy '{other}' (expected requeue, fail or ignore)"
            )),
        }
    }
}

impl std::fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requeue => write!(f, "requeue"),
            Self::Fail => write!(f, "fail"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub markers_inspected: usize,
    pub requeued: usize,
    pub failed: usize,
    pub ignored: usize,
    pub temp_removed: usize,
}

impl SweepReport {
    pub fn recovered(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Sweep both directories once.
pub fn sweep(
    request_dir: &Path,
    writer: &ResponseWriter,
    stale_after: Duration,
    policy: OrphanPolicy,
) -> SpoolResult<SweepReport> {
    let mut report = SweepReport::default();
    let now = SystemTime::now();

    for name in list_names(request_dir)? {
        let path = request_dir.join(&name);
        if let Some(id) = claimed_id(&name) {
            report.markers_inspected += 1;
            if !is_stale(&path, now, stale_after) {
                continue;
            }
            handle_orphan(request_dir, id, writer, policy, &mut report);
        } else if is_temp(&name) && is_stale(&path, now, stale_after) {
            remove_temp(&path, &mut report);
        }
    }

    if writer.dir().is_dir() {
        for name in list_names(writer.dir())? {
            let path = writer.dir().join(&name);
            if is_temp(&name) && is_stale(&path, now, stale_after) {
                remove_temp(&path, &mut report);
            }
        }
    }

    if report.recovered() > 0 || report.temp_removed > 0 {
        info!(
            requeued = report.requeued,
            failed = report.failed,
            ignored = report.ignored,
            temp_removed = report.temp_removed,
            "orphan sweep recovered items"
        );
    }
    Ok(report)
}

fn handle_orphan(
    request_dir: &Path,
    id: &str,
    writer: &ResponseWriter,
    policy: OrphanPolicy,
    report: &mut SweepReport,
) {
    let marker = claim_path(request_dir, id);
    match policy {
        OrphanPolicy::Requeue => {
            let pending = request_path(request_dir, id);
            if pending.exists() {
                warn!(id = %id, "orphaned claim has a pending resubmission; leaving both");
                report.ignored += 1;
                return;
            }
            match fs::rename(&marker, &pending) {
                Ok(()) => {
                    warn!(id = %id, "requeued orphaned request");
                    report.requeued += 1;
                }
                // Another sweeper, or the owner finishing late, got there first.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(id = %id, error = %e, "failed to requeue orphaned request"),
            }
        }
        OrphanPolicy::Fail => {
            if writer.publish_logged(id, &SpoolResponse::failure(id, ABANDONED_ERROR)) {
                release_marker(&marker);
                warn!(id = %id, "failed orphaned request");
                report.failed += 1;
            }
        }
        OrphanPolicy::Ignore => {
            warn!(id = %id, path = %marker.display(), "orphaned claim left in place");
            report.ignored += 1;
        }
    }
}

fn remove_temp(path: &Path, report: &mut SweepReport) {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale staging file");
            report.temp_removed += 1;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale staging file"),
    }
}

fn list_names(dir: &Path) -> SpoolResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| SpoolError::io("read dir", dir, e))?;
    Ok(entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect())
}

fn is_temp(name: &str) -> bool {
    name.ends_with(&format!(".{TEMP_EXT}"))
}

fn is_stale(path: &Path, now: SystemTime, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| now.duration_since(mtime).unwrap_or_default() >= stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn age(path: &Path, secs: u64) {
        let then = SystemTime::now() - Duration::from_secs(secs);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(then)
            .unwrap();
    }

    struct Dirs {
        _tmp: TempDir,
        req: std::path::PathBuf,
        writer: ResponseWriter,
    }

    fn dirs() -> Dirs {
        let tmp = TempDir::new().unwrap();
        let req = tmp.path().join("req");
        let resp = tmp.path().join("resp");
        fs::create_dir_all(&req).unwrap();
        fs::create_dir_all(&resp).unwrap();
        Dirs {
            _tmp: tmp,
            req,
            writer: ResponseWriter::new(resp),
        }
    }

    #[test]
    fn policy_parses() {
        assert_eq!("requeue".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Requeue));
        assert_eq!(" FAIL ".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Fail));
        assert_eq!("ignore".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Ignore));
        assert!("drop".parse::<OrphanPolicy>().is_err());
        assert_eq!(OrphanPolicy::Fail.to_string(), "fail");
    }

    #[test]
    fn stale_marker_is_requeued() {
        let d = dirs();
        let marker = claim_path(&d.req, "old");
        fs::write(&marker, r#"{"data":"aGk="}"#).unwrap();
        age(&marker, 3600);

        let report = sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Requeue)
            .unwrap();

        assert_eq!(report.requeued, 1);
        assert!(!marker.exists());
        assert!(request_path(&d.req, "old").exists());
    }

    #[test]
    fn fresh_marker_is_left_alone() {
        let d = dirs();
        let marker = claim_path(&d.req, "live");
        fs::write(&marker, r#"{"data":"aGk="}"#).unwrap();

        let report = sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Requeue)
            .unwrap();

        assert_eq!(report.markers_inspected, 1);
        assert_eq!(report.recovered(), 0);
        assert!(marker.exists());
    }

    #[test]
    fn fail_policy_publishes_error() {
        let d = dirs();
        let marker = claim_path(&d.req, "dead");
        fs::write(&marker, "{}").unwrap();
        age(&marker, 3600);

        let report =
            sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Fail).unwrap();

        assert_eq!(report.failed, 1);
        assert!(!marker.exists());
        let body = fs::read(d.writer.dir().join("dead.json")).unwrap();
        let resp: SpoolResponse = serde_json::from_slice(&body).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some(ABANDONED_ERROR));
    }

    #[test]
    fn ignore_policy_keeps_marker() {
        let d = dirs();
        let marker = claim_path(&d.req, "stuck");
        fs::write(&marker, "{}").unwrap();
        age(&marker, 3600);

        let report =
            sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Ignore).unwrap();
        assert_eq!(report.ignored, 1);
        assert!(marker.exists());
    }

    #[test]
    fn requeue_does_not_clobber_resubmission() {
        let d = dirs();
        let marker = claim_path(&d.req, "dup");
        fs::write(&marker, "old").unwrap();
        age(&marker, 3600);
        fs::write(request_path(&d.req, "dup"), "new").unwrap();

        let report = sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Requeue)
            .unwrap();

        assert_eq!(report.requeued, 0);
        assert_eq!(fs::read_to_string(request_path(&d.req, "dup")).unwrap(), "new");
    }

    #[test]
    fn stale_temp_files_are_removed() {
        let d = dirs();
        let stale_resp = d.writer.dir().join("a.tmp");
        let fresh_resp = d.writer.dir().join("b.tmp");
        let stale_req = d.req.join("c.json.tmp");
        for p in [&stale_resp, &fresh_resp, &stale_req] {
            fs::write(p, "partial").unwrap();
        }
        age(&stale_resp, 3600);
        age(&stale_req, 3600);

        let report = sweep(&d.req, &d.writer, Duration::from_secs(60), OrphanPolicy::Requeue)
            .unwrap();

        assert_eq!(report.temp_removed, 2);
        assert!(!stale_resp.exists());
        assert!(!stale_req.exists());
        assert!(fresh_resp.exists());
    }
}
