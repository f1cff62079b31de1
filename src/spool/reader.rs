//! Reading a claimed request despite producers that are still writing it.
//!
//! A request can become visible before its content is flushed. Claiming first
//! and verifying afterwards is cheap, so the reader tolerates an empty body
//! for a bounded number of attempts before giving up. Once the body has
//! content it is parsed exactly once.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::protocol::{RequestBody, SpoolRequest};

/// Retry budget for a claimed request whose body is not readable yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadPolicy {
    pub attempts: u32,
    #[serde(rename = "delay_ms", with = "crate::config::duration_ms")]
    pub delay: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// What reading a claimed request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Parsed and validated.
    Ready(SpoolRequest),
    /// The file disappeared underneath us. Not an error.
    Vanished,
    /// Still empty after the whole budget.
    NotReady { attempts: u32 },
    /// Structurally invalid content; retrying would not help.
    Malformed(String),
    /// Well-formed but unusable (missing `data`, bad option). Deserves an
    /// error response.
    Invalid(String),
}

/// Parse the request held by the claim marker at `path`.
pub fn read_claimed(path: &Path, id: &str, policy: &ReadPolicy) -> ReadOutcome {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match try_read(path, id) {
            Attempt::Done(outcome) => return outcome,
            Attempt::Retry(reason) => {
                trace!(id = %id, attempt, reason, "request not readable yet");
                if attempt < attempts {
                    std::thread::sleep(policy.delay);
                }
            }
        }
    }

    debug!(id = %id, attempts, "request never became readable");
    ReadOutcome::NotReady { attempts }
}

enum Attempt {
    Done(ReadOutcome),
    Retry(&'static str),
}

fn try_read(path: &Path, id: &str) -> Attempt {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Attempt::Done(ReadOutcome::Vanished),
        Err(_) => return Attempt::Retry("metadata unavailable"),
    };
    if len == 0 {
        return Attempt::Retry("empty");
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Attempt::Done(ReadOutcome::Vanished),
        Err(_) => return Attempt::Retry("read failed"),
    };
    if bytes.is_empty() {
        return Attempt::Retry("empty");
    }

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => return Attempt::Done(ReadOutcome::Malformed(e.to_string())),
    };

    if !value.is_object() {
        return Attempt::Done(ReadOutcome::Invalid(
            "request body must be a JSON object".to_string(),
        ));
    }

    let body: RequestBody = match RequestBody::deserialize(value) {
        Ok(body) => body,
        Err(e) => return Attempt::Done(ReadOutcome::Invalid(format!("invalid request: {e}"))),
    };

    Attempt::Done(match body.validate(id) {
        Ok(request) => ReadOutcome::Ready(request),
        Err(reason) => ReadOutcome::Invalid(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast() -> ReadPolicy {
        ReadPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn reads_valid_request() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r1.processing");
        fs::write(&path, r#"{"data":"aGVsbG8=","min_confidence":0.25}"#).unwrap();

        match read_claimed(&path, "r1", &fast()) {
            ReadOutcome::Ready(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.payload, b"hello");
                assert_eq!(req.options.min_confidence, 0.25);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn missing_file_vanishes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.processing");
        assert_eq!(read_claimed(&path, "gone", &fast()), ReadOutcome::Vanished);
    }

    #[test]
    fn empty_file_exhausts_budget() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("e.processing");
        fs::write(&path, "").unwrap();
        assert_eq!(
            read_claimed(&path, "e", &fast()),
            ReadOutcome::NotReady { attempts: 3 }
        );
    }

    #[test]
    fn truncated_json_is_malformed_without_retry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.processing");
        fs::write(&path, r#"{"data":"aGVs"#).unwrap();
        let slow = ReadPolicy {
            attempts: 10,
            delay: Duration::from_secs(1),
        };

        let start = std::time::Instant::now();
        let outcome = read_claimed(&path, "t", &slow);
        assert!(matches!(outcome, ReadOutcome::Malformed(_)), "{outcome:?}");
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn garbage_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("g.processing");
        fs::write(&path, "not json at all").unwrap();
        assert!(matches!(
            read_claimed(&path, "g", &fast()),
            ReadOutcome::Malformed(_)
        ));
    }

    #[test]
    fn missing_data_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r2.processing");
        fs::write(&path, r#"{"return_multiple":true}"#).unwrap();
        match read_claimed(&path, "r2", &fast()) {
            ReadOutcome::Invalid(reason) => assert!(reason.contains("\"data\"")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn non_object_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.processing");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            read_claimed(&path, "a", &fast()),
            ReadOutcome::Invalid(_)
        ));
    }

    #[test]
    fn wrong_option_type_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("w.processing");
        fs::write(&path, r#"{"data":"aGk=","return_multiple":"yes"}"#).unwrap();
        assert!(matches!(
            read_claimed(&path, "w", &fast()),
            ReadOutcome::Invalid(_)
        ));
    }

    #[test]
    fn late_writer_is_picked_up() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("late.processing");
        fs::write(&path, "").unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            fs::write(&writer_path, r#"{"data":"aGk="}"#).unwrap();
        });

        let outcome = read_claimed(&path, "late", &ReadPolicy::default());
        writer.join().unwrap();
        assert!(matches!(outcome, ReadOutcome::Ready(_)), "{outcome:?}");
    }
}
