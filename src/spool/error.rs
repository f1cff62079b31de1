use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by spool filesystem operations.
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize response for {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

impl SpoolError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type SpoolResult<T> = Result<T, SpoolError>;
