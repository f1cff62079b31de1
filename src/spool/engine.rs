//! Inference engine seam.
//!
//! The daemon exists to keep one expensive engine warm. It is constructed
//! once at startup through [`load_engine`] and then called synchronously from
//! the daemon loop thread for every request; engines never touch the spool
//! directories.
//!
//! # Built-in engines
//!
//! | Name | Output | Notes |
//! |------|--------|-------|
//! | echo | payload unchanged, confidence 1.0 | Always available, deterministic |
//! | frame | full frame re-encoded as PNG | Requires the `frame` feature |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::protocol::{Detection, InferOptions, InferenceOutput};

#[cfg(feature = "frame")]
pub const DEFAULT_ENGINE: &str = "frame";
#[cfg(not(feature = "frame"))]
pub const DEFAULT_ENGINE: &str = "echo";

/// Per-request engine failure. The message is what the producer sees in the
/// failure response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("unreadable image: {0}")]
    Unreadable(String),

    #[error("{0}")]
    Rejected(String),
}

/// Startup failure while constructing an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown engine '{name}' (available: {available})")]
    Unknown { name: String, available: String },

    #[error("model path does not exist: {0}")]
    MissingModel(PathBuf),

    #[error("engine '{name}' failed to load: {reason}")]
    Load { name: String, reason: String },
}

/// The capability the daemon amortizes.
pub trait InferenceEngine: Send + Sync {
    /// Stable identifier reported in success responses.
    fn id(&self) -> &str;

    /// Run inference on one decoded payload.
    fn infer(
        &self,
        payload: &[u8],
        options: &InferOptions,
    ) -> Result<InferenceOutput, InferenceError>;
}

/// Startup parameters handed to an engine constructor.
#[derive(Debug, Clone, Default)]
pub struct EngineInit {
    /// Pre-trained resource to load, if the engine needs one.
    pub model_path: Option<PathBuf>,
}

/// A built-in engine that can be selected by name.
#[derive(Debug, Clone)]
pub struct RegisteredEngine {
    pub name: &'static str,
    pub description: &'static str,
}

/// Engines compiled into this binary.
pub fn registered_engines() -> Vec<RegisteredEngine> {
    let mut engines = vec![RegisteredEngine {
        name: "echo",
        description: "returns the payload as a single full-confidence detection",
    }];
    #[cfg(feature = "frame")]
    engines.push(RegisteredEngine {
        name: "frame",
        description: "decodes an image and returns the full frame as PNG",
    });
    engines
}

/// Construct the named engine. Called once per process.
pub fn load_engine(name: &str, init: &EngineInit) -> Result<Arc<dyn InferenceEngine>, EngineError> {
    if let Some(path) = init.model_path.as_deref() {
        ensure_model(path)?;
    }

    let engine: Arc<dyn InferenceEngine> = match name {
        "echo" => Arc::new(EchoEngine),
        #[cfg(feature = "frame")]
        "frame" => Arc::new(FrameEngine::new(init)),
        other => {
            let available = registered_engines()
                .iter()
                .map(|e| e.name)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::Unknown {
                name: other.to_string(),
                available,
            });
        }
    };

    info!(engine = engine.id(), model = ?init.model_path, "inference engine loaded");
    Ok(engine)
}

fn ensure_model(path: &Path) -> Result<(), EngineError> {
    if path.exists() {
        Ok(())
    } else {
        Err(EngineError::MissingModel(path.to_path_buf()))
    }
}

/// Pass-through engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoEngine;

impl InferenceEngine for EchoEngine {
    fn id(&self) -> &str {
        "echo"
    }

    fn infer(
        &self,
        payload: &[u8],
        _options: &InferOptions,
    ) -> Result<InferenceOutput, InferenceError> {
        if payload.is_empty() {
            return Err(InferenceError::Rejected("empty payload".to_string()));
        }
        let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Ok(InferenceOutput {
            detections: vec![Detection {
                payload: payload.to_vec(),
                confidence: 1.0,
                bbox: [0, 0, len, 1],
            }],
            original_size: None,
        })
    }
}

/// Decodes the payload as an image and returns the whole frame.
#[cfg(feature = "frame")]
#[derive(Debug, Default, Clone)]
pub struct FrameEngine;

#[cfg(feature = "frame")]
impl FrameEngine {
    pub fn new(init: &EngineInit) -> Self {
        if let Some(path) = &init.model_path {
            tracing::debug!(model = %path.display(), "frame engine has no weights to load");
        }
        Self
    }
}

#[cfg(feature = "frame")]
impl InferenceEngine for FrameEngine {
    fn id(&self) -> &str {
        "frame"
    }

    fn infer(
        &self,
        payload: &[u8],
        _options: &InferOptions,
    ) -> Result<InferenceOutput, InferenceError> {
        let img = image::load_from_memory(payload)
            .map_err(|e| InferenceError::Unreadable(e.to_string()))?;
        let (width, height) = (img.width(), img.height());

        let mut encoded = std::io::Cursor::new(Vec::new());
        img.write_to(&mut encoded, image::ImageFormat::Png)
            .map_err(|e| InferenceError::Rejected(format!("failed to encode frame: {e}")))?;

        Ok(InferenceOutput {
            detections: vec![Detection {
                payload: encoded.into_inner(),
                confidence: 1.0,
                bbox: [0, 0, width, height],
            }],
            original_size: Some([width, height]),
        })
    }
}
