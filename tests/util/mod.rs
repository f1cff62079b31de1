use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use inference_spool::config::SpoolConfig;
use inference_spool::spool::protocol::{claim_path, request_path, response_path};
use inference_spool::spool::{
    Detection, InferOptions, InferenceEngine, InferenceError, InferenceOutput, ReadPolicy,
    SpoolResponse,
};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::TRACE)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A request/response directory pair in a temp dir.
#[allow(dead_code)]
pub struct SpoolFixture {
    pub dir: TempDir,
    pub requests: PathBuf,
    pub responses: PathBuf,
}

#[allow(dead_code)]
impl SpoolFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let requests = dir.path().join("requests");
        let responses = dir.path().join("responses");
        std::fs::create_dir_all(&requests).expect("request dir");
        Self {
            dir,
            requests,
            responses,
        }
    }

    /// Fast-cycling config with the orphan sweep disabled.
    pub fn config(&self) -> SpoolConfig {
        SpoolConfig {
            request_dir: self.requests.clone(),
            response_dir: self.responses.clone(),
            engine: "echo".to_string(),
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(20),
            read: ReadPolicy {
                attempts: 10,
                delay: Duration::from_millis(10),
            },
            stale_after: Duration::ZERO,
            ..SpoolConfig::default()
        }
    }

    /// Drop a raw request body in place, the way a careless producer would.
    pub fn drop_request(&self, id: &str, body: &str) -> PathBuf {
        let path = request_path(&self.requests, id);
        std::fs::write(&path, body).expect("write request");
        path
    }

    pub fn request(&self, id: &str) -> PathBuf {
        request_path(&self.requests, id)
    }

    pub fn marker(&self, id: &str) -> PathBuf {
        claim_path(&self.requests, id)
    }

    pub fn response_file(&self, id: &str) -> PathBuf {
        response_path(&self.responses, id)
    }

    pub fn response(&self, id: &str) -> SpoolResponse {
        let bytes = std::fs::read(self.response_file(id)).expect("response exists");
        serde_json::from_slice(&bytes).expect("response parses")
    }

    /// File names in `dir`, sorted.
    pub fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Engine returning fixed detections and counting calls.
#[allow(dead_code)]
pub struct ScriptedEngine {
    scores: Vec<f32>,
    delay: Duration,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedEngine {
    pub fn scoring(scores: &[f32]) -> Self {
        Self {
            scores: scores.to_vec(),
            delay: Duration::ZERO,
            fail_with: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::scoring(&[])
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn id(&self) -> &str {
        "scripted"
    }

    fn infer(
        &self,
        payload: &[u8],
        _options: &InferOptions,
    ) -> Result<InferenceOutput, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(msg) = &self.fail_with {
            return Err(InferenceError::Rejected(msg.clone()));
        }
        let detections = self
            .scores
            .iter()
            .enumerate()
            .map(|(i, &confidence)| Detection {
                payload: payload.to_vec(),
                confidence,
                bbox: [i as u32 * 10, 0, 10, 10],
            })
            .collect();
        Ok(InferenceOutput {
            detections,
            original_size: Some([640, 480]),
        })
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
