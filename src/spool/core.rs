//! The daemon loop: scan, claim, read, infer, publish, release.

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::claim::{Claim, try_claim};
use super::engine::InferenceEngine;
use super::error::{SpoolError, SpoolResult};
use super::protocol::{InferenceOutput, SpoolRequest, SpoolResponse, candidate_id};
use super::reader::{ReadOutcome, read_claimed};
use super::recovery::{SweepReport, sweep};
use super::wake::IdleWait;
use super::writer::ResponseWriter;
use crate::config::SpoolConfig;

/// Cooperative stop flag shared between the loop and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the request it is currently handling.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened during one or more scan cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Scan cycles run.
    pub cycles: usize,
    /// Pending request files seen.
    pub candidates: usize,
    /// Requests this instance won the claim for.
    pub claimed: usize,
    /// Success responses published.
    pub published: usize,
    /// Failure responses published.
    pub failed: usize,
    /// Claimed requests dropped without a response (unreadable or vanished).
    pub abandoned: usize,
    /// Candidates lost to another instance or already gone.
    pub skipped: usize,
    /// Responses that could not be written.
    pub write_errors: usize,
}

impl CycleReport {
    fn absorb(&mut self, other: &CycleReport) {
        self.cycles += other.cycles;
        self.candidates += other.candidates;
        self.claimed += other.claimed;
        self.published += other.published;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
        self.skipped += other.skipped;
        self.write_errors += other.write_errors;
    }
}

enum Handled {
    Published,
    Failed,
    Abandoned,
    WriteError,
}

/// A daemon instance bound to one directory pair and one loaded engine.
pub struct SpoolDaemon {
    config: SpoolConfig,
    engine: Arc<dyn InferenceEngine>,
    writer: ResponseWriter,
    shutdown: ShutdownHandle,
    last_sweep: Mutex<Option<Instant>>,
    totals: Mutex<CycleReport>,
}

impl SpoolDaemon {
    pub fn new(config: SpoolConfig, engine: Arc<dyn InferenceEngine>) -> Self {
        let writer = ResponseWriter::new(config.response_dir.clone());
        Self {
            config,
            engine,
            writer,
            shutdown: ShutdownHandle::new(),
            last_sweep: Mutex::new(None),
            totals: Mutex::new(CycleReport::default()),
        }
    }

    /// Use an externally owned stop flag.
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Counters accumulated since the daemon was created.
    pub fn totals(&self) -> CycleReport {
        *self.totals.lock()
    }

    /// Identities of pending requests, in name order.
    pub fn scan(&self) -> SpoolResult<Vec<String>> {
        let dir = &self.config.request_dir;
        let entries = fs::read_dir(dir).map_err(|e| SpoolError::io("scan", dir, e))?;

        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                candidate_id(&name).map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Run one scan cycle: sweep orphans when due, then handle every
    /// candidate present at scan time.
    pub fn tick(&self) -> SpoolResult<CycleReport> {
        self.maybe_sweep();

        let mut report = CycleReport {
            cycles: 1,
            ..CycleReport::default()
        };
        for id in self.scan()? {
            report.candidates += 1;
            if self.shutdown.is_requested() {
                debug!("shutdown requested mid-cycle; leaving remaining requests pending");
                break;
            }
            let Some(claim) = try_claim(&self.config.request_dir, &id) else {
                report.skipped += 1;
                continue;
            };
            report.claimed += 1;
            match self.process(claim) {
                Handled::Published => report.published += 1,
                Handled::Failed => report.failed += 1,
                Handled::Abandoned => report.abandoned += 1,
                Handled::WriteError => report.write_errors += 1,
            }
        }

        self.totals.lock().absorb(&report);
        Ok(report)
    }

    /// Handle one claimed request. The claim is released on every path when
    /// it drops at the end of this function.
    fn process(&self, claim: Claim) -> Handled {
        let id = claim.id().to_string();

        let request = match read_claimed(claim.path(), &id, &self.config.read) {
            ReadOutcome::Ready(request) => request,
            ReadOutcome::Vanished => {
                debug!(id = %id, "claimed request vanished before it could be read");
                return Handled::Abandoned;
            }
            ReadOutcome::NotReady { attempts } => {
                warn!(id = %id, attempts, "request never became readable; discarding");
                return Handled::Abandoned;
            }
            ReadOutcome::Malformed(reason) => {
                warn!(id = %id, error = %reason, "discarding malformed request");
                return Handled::Abandoned;
            }
            ReadOutcome::Invalid(reason) => {
                warn!(id = %id, error = %reason, "rejecting invalid request");
                return self.respond(&id, SpoolResponse::failure(&id, reason), Handled::Failed);
            }
        };

        let started = Instant::now();
        let response = match self.infer(&request) {
            Ok(output) => {
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                info!(
                    id = %id,
                    detections = output.detections.len(),
                    elapsed_ms,
                    "request processed"
                );
                SpoolResponse::success(&id, self.engine.id(), output, elapsed_ms)
            }
            Err(reason) => {
                warn!(id = %id, error = %reason, "inference failed");
                SpoolResponse::failure(&id, reason)
            }
        };
        let outcome = if response.success {
            Handled::Published
        } else {
            Handled::Failed
        };
        self.respond(&id, response, outcome)
    }

    fn respond(&self, id: &str, response: SpoolResponse, outcome: Handled) -> Handled {
        if self.writer.publish_logged(id, &response) {
            outcome
        } else {
            Handled::WriteError
        }
    }

    /// Run the engine and apply the request's option policy. A panicking
    /// engine is reported as a failure for this request only.
    fn infer(&self, request: &SpoolRequest) -> Result<InferenceOutput, String> {
        let engine = &self.engine;
        let result = catch_unwind(AssertUnwindSafe(|| {
            engine.infer(&request.payload, &request.options)
        }));
        match result {
            Ok(Ok(output)) => output.select(&request.options),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(id = %request.id, panic = %msg, "engine panicked");
                Err(format!("engine panicked: {msg}"))
            }
        }
    }

    /// Sweep for orphaned claims if enabled and the interval has elapsed.
    fn maybe_sweep(&self) -> Option<SweepReport> {
        if !self.config.sweeps_orphans() {
            return None;
        }
        {
            let mut last = self.last_sweep.lock();
            if let Some(at) = *last
                && at.elapsed() < self.config.sweep_interval
            {
                return None;
            }
            *last = Some(Instant::now());
        }
        match sweep(
            &self.config.request_dir,
            &self.writer,
            self.config.stale_after,
            self.config.orphan_policy,
        ) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "orphan sweep failed");
                None
            }
        }
    }

    /// Run until shutdown is requested. Returns the accumulated counters.
    pub fn run(&self) -> SpoolResult<CycleReport> {
        fs::create_dir_all(&self.config.request_dir)
            .map_err(|e| SpoolError::io("create request dir", &self.config.request_dir, e))?;
        fs::create_dir_all(&self.config.response_dir)
            .map_err(|e| SpoolError::io("create response dir", &self.config.response_dir, e))?;

        let idle = if self.config.watch {
            IdleWait::watch(&self.config.request_dir).unwrap_or_else(|e| {
                warn!(error = %e, "directory watch unavailable; polling instead");
                IdleWait::poll()
            })
        } else {
            IdleWait::poll()
        };

        info!(
            requests = %self.config.request_dir.display(),
            responses = %self.config.response_dir.display(),
            engine = self.engine.id(),
            poll_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            orphan_policy = %self.config.orphan_policy,
            "spool daemon started"
        );

        while !self.shutdown.is_requested() {
            idle.drain();
            match self.tick() {
                Ok(_) => idle.wait(self.config.poll_interval, &self.shutdown),
                Err(e) => {
                    error!(error = %e, "scan cycle failed; backing off");
                    idle.wait(self.config.error_backoff, &self.shutdown);
                }
            }
        }

        let totals = self.totals();
        info!(
            cycles = totals.cycles,
            published = totals.published,
            failed = totals.failed,
            abandoned = totals.abandoned,
            write_errors = totals.write_errors,
            "spool daemon stopped"
        );
        Ok(totals)
    }
}
