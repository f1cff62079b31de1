//! File-mediated request spool.
//!
//! One long-lived process loads an [`InferenceEngine`] once and serves any
//! number of short-lived producers that talk to it only through two
//! directories:
//!
//! ```text
//! producer                     request dir                 daemon
//!   write <id>.json.tmp  ──►   <id>.json.tmp
//!   rename               ──►   <id>.json          ◄── scan
//!                              <id>.processing    ◄── claim (rename)
//!                                                     read, infer
//!                              response dir
//!                              <id>.tmp           ◄── stage + fsync
//!   poll, read, delete   ◄──   <id>.json          ◄── rename
//!                              (marker removed)   ◄── release
//! ```
//!
//! Several daemon instances may share a directory pair; the claim rename
//! guarantees each request is handled by exactly one of them. That
//! guarantee relies on `rename(2)` being atomic, which some network
//! filesystems do not provide.

pub mod claim;
pub mod client;
pub mod core;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod reader;
pub mod recovery;
pub mod status;
pub mod wake;
pub mod writer;

pub use claim::{Claim, try_claim};
pub use client::{ClientError, SpoolClient};
pub use self::core::{CycleReport, ShutdownHandle, SpoolDaemon};
pub use engine::{EngineInit, InferenceEngine, InferenceError, load_engine};
pub use error::{SpoolError, SpoolResult};
pub use protocol::{Detection, InferOptions, InferenceOutput, SpoolRequest, SpoolResponse};
pub use reader::{ReadOutcome, ReadPolicy};
pub use recovery::{OrphanPolicy, SweepReport};
pub use writer::ResponseWriter;
