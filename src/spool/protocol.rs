//! Wire contract of the spool: file naming and the JSON request/response shapes.
//!
//! A spool is a directory pair. Producers drop `<id>.json` into the request
//! directory; the daemon answers with `<id>.json` in the response directory.
//! Everything in between (the `.processing` claim marker, the `.tmp` staging
//! file) is derived from the same stem. Stems starting with `.` are reserved
//! for hidden files and never picked up as requests.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Extension of a request or response file that is ready to be read.
pub const REQUEST_EXT: &str = "json";

/// Extension of a request file owned by a daemon instance.
pub const CLAIM_EXT: &str = "processing";

/// Extension of a staging file that must never be read by anyone but its writer.
pub const TEMP_EXT: &str = "tmp";

/// Default `min_confidence` when the request omits it.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Path of the pending request file for `id`.
pub fn request_path(request_dir: &Path, id: &str) -> PathBuf {
    request_dir.join(format!("{id}.{REQUEST_EXT}"))
}

/// Path of the in-progress marker for `id`.
pub fn claim_path(request_dir: &Path, id: &str) -> PathBuf {
    request_dir.join(format!("{id}.{CLAIM_EXT}"))
}

/// Path of the published response for `id`.
pub fn response_path(response_dir: &Path, id: &str) -> PathBuf {
    response_dir.join(format!("{id}.{REQUEST_EXT}"))
}

/// Path of the staging file a response is written to before the rename.
pub fn response_temp_path(response_dir: &Path, id: &str) -> PathBuf {
    response_dir.join(format!("{id}.{TEMP_EXT}"))
}

/// Returns the request identity if `file_name` names a pending request.
///
/// Only `<stem>.json` qualifies. Claim markers, staging files and producer-side
/// `<stem>.json.tmp` files are never candidates. Hidden files are skipped as
/// well, so a producer that writes `.x.json` directly is never answered; use a
/// stem that does not start with `.`.
pub fn candidate_id(file_name: &str) -> Option<&str> {
    if file_name.starts_with('.') {
        return None;
    }
    let stem = file_name.strip_suffix(".json")?;
    if stem.is_empty()
        || stem.ends_with(&format!(".{CLAIM_EXT}"))
        || stem.ends_with(&format!(".{TEMP_EXT}"))
    {
        return None;
    }
    Some(stem)
}

/// Returns the request identity if `file_name` is a claim marker.
pub fn claimed_id(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(&format!(".{CLAIM_EXT}"))
        .filter(|stem| !stem.is_empty())
}

/// Options a producer may attach to a request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferOptions {
    /// Return every detection above the threshold instead of only the best one.
    #[serde(default)]
    pub return_multiple: bool,
    /// Detections scoring below this are discarded.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

impl Default for InferOptions {
    fn default() -> Self {
        Self {
            return_multiple: false,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Request body as it appears on disk.
///
/// `data` is optional here so a missing payload surfaces as a validation
/// failure with an error response rather than a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default, alias = "image", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_multiple: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
}

impl RequestBody {
    /// Build a body for `payload`, encoding it for transport.
    pub fn new(payload: &[u8], options: InferOptions) -> Self {
        Self {
            data: Some(BASE64.encode(payload)),
            return_multiple: Some(options.return_multiple),
            min_confidence: Some(options.min_confidence),
        }
    }

    /// Check the mandatory fields and decode the payload.
    pub fn validate(self, id: &str) -> Result<SpoolRequest, String> {
        let encoded = match self.data {
            Some(data) if !data.trim().is_empty() => data,
            _ => return Err("missing \"data\" field in request".to_string()),
        };
        let payload = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("invalid base64 in \"data\" field: {e}"))?;

        let min_confidence = self.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(format!(
                "\"min_confidence\" must be within [0, 1], got {min_confidence}"
            ));
        }

        Ok(SpoolRequest {
            id: id.to_string(),
            payload,
            options: InferOptions {
                return_multiple: self.return_multiple.unwrap_or(false),
                min_confidence,
            },
        })
    }
}

/// A claimed, parsed and validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolRequest {
    pub id: String,
    pub payload: Vec<u8>,
    pub options: InferOptions,
}

/// Serde adapter: bytes as standard base64 strings.
pub mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// One detection/extraction produced by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Engine-specific payload (a cropped image, extracted text, ...).
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// `[x, y, width, height]` in the coordinate space of the input.
    pub bbox: [u32; 4],
}

/// Successful engine output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<[u32; 2]>,
}

impl InferenceOutput {
    /// Apply the request options to raw engine output.
    ///
    /// Drops detections under `min_confidence`; keeps only the best one unless
    /// `return_multiple` is set. Fails when nothing survives the threshold.
    pub fn select(mut self, options: &InferOptions) -> Result<Self, String> {
        self.detections.retain(|d| d.confidence >= options.min_confidence);
        if self.detections.is_empty() {
            return Err("no detection above threshold".to_string());
        }
        self.detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        if !options.return_multiple {
            self.detections.truncate(1);
        }
        Ok(self)
    }
}

/// Response file body. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InferenceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpoolResponse {
    pub fn success(id: &str, engine: &str, result: InferenceOutput, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            id: Some(id.to_string()),
            engine: Some(engine.to_string()),
            elapsed_ms: Some(elapsed_ms),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            id: Some(id.to_string()),
            engine: None,
            elapsed_ms: None,
            result: None,
            error: Some(error.into()),
        }
    }
}
