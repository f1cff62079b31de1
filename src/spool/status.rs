//! Point-in-time census of a spool directory pair.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::protocol::{REQUEST_EXT, TEMP_EXT, candidate_id, claimed_id};
use crate::config::SpoolConfig;

#[derive(Debug, Clone, Serialize)]
pub struct SpoolStatus {
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_timestamp: Option<&'static str>,
    pub engine: String,
    pub request_dir: PathBuf,
    pub response_dir: PathBuf,
    /// Requests waiting to be claimed.
    pub pending: usize,
    /// Requests currently claimed by some instance.
    pub in_progress: usize,
    /// Responses not yet consumed by their producers.
    pub responses: usize,
    /// Staging files in either directory.
    pub staging: usize,
    /// Mtime of the oldest claim marker, if any.
    pub oldest_claim: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

/// Count files in the configured directories. Missing directories count as
/// empty.
pub fn collect(config: &SpoolConfig) -> SpoolStatus {
    let mut status = SpoolStatus {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP"),
        engine: config.engine.clone(),
        request_dir: config.request_dir.clone(),
        response_dir: config.response_dir.clone(),
        pending: 0,
        in_progress: 0,
        responses: 0,
        staging: 0,
        oldest_claim: None,
        generated_at: Utc::now(),
    };

    let mut oldest: Option<SystemTime> = None;
    for (name, path) in files(&config.request_dir) {
        if candidate_id(&name).is_some() {
            status.pending += 1;
        } else if claimed_id(&name).is_some() {
            status.in_progress += 1;
            if let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified()) {
                oldest = Some(oldest.map_or(mtime, |o| o.min(mtime)));
            }
        } else if is_temp(&name) {
            status.staging += 1;
        }
    }
    for (name, _) in files(&config.response_dir) {
        if name.ends_with(&format!(".{REQUEST_EXT}")) {
            status.responses += 1;
        } else if is_temp(&name) {
            status.staging += 1;
        }
    }
    status.oldest_claim = oldest.map(DateTime::<Utc>::from);
    status
}

fn is_temp(name: &str) -> bool {
    name.ends_with(&format!(".{TEMP_EXT}"))
}

fn files(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| Some((e.file_name().into_string().ok()?, e.path())))
        .collect()
}
