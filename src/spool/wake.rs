//! Idle waiting between scan cycles.
//!
//! Polling at a fixed interval is the baseline and is all correctness relies
//! on. With `watch` enabled a notify watcher on the request directory cuts the
//! wait short when something lands there; the interval still bounds the wait,
//! so a missed or coalesced event costs at most one interval.
//!
//! Only events that can make a new request visible wake the loop: a created
//! `<id>.json` or a rename landing on one. The daemon's own directory reads,
//! claim renames and marker deletions are ignored.

use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tracing::{debug, info};

use super::core::ShutdownHandle;
use super::error::{SpoolError, SpoolResult};
use super::protocol::candidate_id;

/// Upper bound on how long a wait goes without checking for shutdown.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(25);

pub enum IdleWait {
    Poll,
    Watch {
        events: Receiver<()>,
        _watcher: RecommendedWatcher,
    },
}

impl IdleWait {
    pub fn poll() -> Self {
        Self::Poll
    }

    /// Watch `dir` (non-recursively) for changes.
    pub fn watch(dir: &Path) -> SpoolResult<Self> {
        let (tx, rx) = unbounded();
        let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res
                && announces_request(&event)
            {
                let _ = tx.send(());
            }
        })
        .map_err(|source| SpoolError::Watch {
            path: dir.to_path_buf(),
            source,
        })?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| SpoolError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        info!(dir = %dir.display(), "watching request directory for changes");
        Ok(Self::Watch {
            events: rx,
            _watcher: watcher,
        })
    }

    /// Discard pending wake-ups. Called right before a scan, which sees
    /// everything those events announced.
    pub fn drain(&self) {
        if let Self::Watch { events, .. } = self {
            while events.try_recv().is_ok() {}
        }
    }

    /// Block for at most `timeout`. Returns early on shutdown or, when
    /// watching, on a directory event.
    pub fn wait(&self, timeout: Duration, shutdown: &ShutdownHandle) {
        let deadline = Instant::now() + timeout;
        loop {
            if shutdown.is_requested() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let slice = remaining.min(SHUTDOWN_CHECK);
            match self {
                Self::Poll => std::thread::sleep(slice),
                Self::Watch { events, .. } => match events.recv_timeout(slice) {
                    Ok(()) => {
                        // Coalesce the burst a single file write produces.
                        while events.try_recv().is_ok() {}
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("watcher channel closed; falling back to polling");
                        std::thread::sleep(slice);
                    }
                },
            }
        }
    }
}

/// Whether `event` may have made a pending request appear.
fn announces_request(event: &Event) -> bool {
    let paths: &[std::path::PathBuf] = match event.kind {
        EventKind::Create(_) => &event.paths,
        // The source side of a rename is a file leaving, e.g. a claim.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => return false,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.last() {
            Some(dest) => std::slice::from_ref(dest),
            None => return false,
        },
        EventKind::Modify(ModifyKind::Name(_)) => &event.paths,
        _ => return false,
    };
    paths.iter().any(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(candidate_id)
            .is_some()
    })
}
