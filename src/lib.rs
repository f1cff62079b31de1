pub mod config;
pub mod spool;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use config::{SpoolConfig, is_truthy};
use spool::client::{ClientError, DEFAULT_TIMEOUT, SpoolClient};
use spool::engine::{EngineInit, load_engine, registered_engines};
use spool::{InferOptions, OrphanPolicy, ShutdownHandle, SpoolDaemon};

/// Exit code for `submit` when the daemon answered with a failure.
pub const EXIT_FAILURE_RESPONSE: u8 = 1;
/// Exit code for `submit` when no response arrived in time.
pub const EXIT_TIMEOUT: u8 = 2;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "spoold",
    version,
    about = "Keep an inference engine warm behind a request/response spool directory pair"
)]
pub struct Cli {
    /// TOML config file (defaults to $SPOOL_CONFIG when set)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon until SIGINT/SIGTERM
    Run {
        /// Directory producers drop requests into
        request_dir: Option<PathBuf>,

        /// Directory responses are published to
        response_dir: Option<PathBuf>,

        /// Pre-trained resource to load at startup
        model_path: Option<PathBuf>,

        /// Engine to load (see `spoold engines`)
        #[arg(long)]
        engine: Option<String>,

        /// Milliseconds between scan cycles
        #[arg(long)]
        poll_ms: Option<u64>,

        /// Wake early on request-directory change notifications
        #[arg(long)]
        watch: bool,

        /// Seconds before a claim marker counts as orphaned (0 disables the sweep)
        #[arg(long)]
        stale_after_secs: Option<u64>,

        /// What to do with orphaned claims: requeue, fail or ignore
        #[arg(long)]
        orphan_policy: Option<OrphanPolicy>,
    },
    /// Submit one payload and print the response as JSON
    Submit {
        /// File whose bytes are sent as the payload
        #[arg(long)]
        file: PathBuf,

        /// Return every detection above the threshold
        #[arg(long)]
        return_multiple: bool,

        /// Minimum confidence in [0, 1]
        #[arg(long)]
        min_confidence: Option<f32>,

        /// Seconds to wait for the response
        #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
        timeout_secs: u64,

        /// Request id (random when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Override the configured request directory
        #[arg(long)]
        request_dir: Option<PathBuf>,

        /// Override the configured response directory
        #[arg(long)]
        response_dir: Option<PathBuf>,
    },
    /// Show pending, in-progress and unconsumed work
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List engines compiled into this binary
    Engines,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run {
            request_dir,
            response_dir,
            model_path,
            engine,
            poll_ms,
            watch,
            stale_after_secs,
            orphan_policy,
        } => {
            let mut cfg = SpoolConfig::load(cli.config.as_deref())?;
            if let Some(dir) = request_dir {
                cfg.request_dir = dir;
            }
            if let Some(dir) = response_dir {
                cfg.response_dir = dir;
            }
            if model_path.is_some() {
                cfg.model_path = model_path;
            }
            if let Some(name) = engine {
                cfg.engine = name;
            }
            if let Some(ms) = poll_ms {
                cfg.poll_interval = Duration::from_millis(ms);
            }
            if watch {
                cfg.watch = true;
            }
            if let Some(secs) = stale_after_secs {
                cfg.stale_after = Duration::from_secs(secs);
            }
            if let Some(policy) = orphan_policy {
                cfg.orphan_policy = policy;
            }
            cfg.validate()?;
            run_daemon(cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Submit {
            file,
            return_multiple,
            min_confidence,
            timeout_secs,
            id,
            request_dir,
            response_dir,
        } => {
            let cfg = SpoolConfig::load(cli.config.as_deref())?;
            let client = SpoolClient::new(
                request_dir.unwrap_or(cfg.request_dir),
                response_dir.unwrap_or(cfg.response_dir),
            );
            let payload = std::fs::read(&file)
                .with_context(|| format!("reading payload {}", file.display()))?;
            let options = InferOptions {
                return_multiple,
                min_confidence: min_confidence
                    .unwrap_or(spool::protocol::DEFAULT_MIN_CONFIDENCE),
            };
            let timeout = Duration::from_secs(timeout_secs);
            run_submit(client, payload, options, id, timeout).await
        }
        Commands::Status { json } => {
            let cfg = SpoolConfig::load(cli.config.as_deref())?;
            let status = spool::status::collect(&cfg);
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("spoold {}", status.version);
                println!("engine:       {}", status.engine);
                println!("requests:     {}", status.request_dir.display());
                println!("responses:    {}", status.response_dir.display());
                println!("pending:      {}", status.pending);
                println!("in progress:  {}", status.in_progress);
                println!("unconsumed:   {}", status.responses);
                println!("staging:      {}", status.staging);
                if let Some(oldest) = status.oldest_claim {
                    println!("oldest claim: {}", oldest.to_rfc3339());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Engines => {
            for engine in registered_engines() {
                println!("{:<8} {}", engine.name, engine.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "spoold", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_daemon(cfg: SpoolConfig) -> Result<()> {
    let init = EngineInit {
        model_path: cfg.model_path.clone(),
    };
    let engine_name = cfg.engine.clone();
    let engine = tokio::task::spawn_blocking(move || load_engine(&engine_name, &init))
        .await
        .context("engine loader panicked")??;

    let shutdown = ShutdownHandle::new();
    tokio::spawn(stop_on_signal(shutdown.clone()));

    let daemon = SpoolDaemon::new(cfg, engine).with_shutdown(shutdown);
    let totals = tokio::task::spawn_blocking(move || daemon.run())
        .await
        .context("daemon loop panicked")??;
    info!(published = totals.published, failed = totals.failed, "exiting");
    Ok(())
}

async fn run_submit(
    client: SpoolClient,
    payload: Vec<u8>,
    options: InferOptions,
    id: Option<String>,
    timeout: Duration,
) -> Result<ExitCode> {
    let result = tokio::task::spawn_blocking(move || {
        let id = match id {
            Some(id) => {
                client.submit_with_id(&id, &payload, options)?;
                id
            }
            None => client.submit(&payload, options)?,
        };
        client.wait(&id, timeout)
    })
    .await
    .context("submit task panicked")?;

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_FAILURE_RESPONSE))
            }
        }
        Err(e @ ClientError::Timeout { .. }) => {
            eprintln!("{e}");
            Ok(ExitCode::from(EXIT_TIMEOUT))
        }
        Err(e) => Err(e.into()),
    }
}

async fn stop_on_signal(shutdown: ShutdownHandle) {
    shutdown_signal().await;
    info!("signal received, finishing current request");
    shutdown.request();
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// `SPOOL_SUPPRESS_LOGS` (or the older `SUPPRESS_OCR_LOGS`) silences all
/// diagnostics.
pub fn logs_suppressed() -> bool {
    ["SPOOL_SUPPRESS_LOGS", "SUPPRESS_OCR_LOGS"]
        .iter()
        .any(|key| dotenvy::var(key).map(|v| is_truthy(&v)).unwrap_or(false))
}

/// Filter directives: suppression wins, then `SPOOL_LOG`, then `RUST_LOG`,
/// then the level implied by the flags.
pub fn log_filter(verbose: bool, quiet: bool) -> String {
    if logs_suppressed() {
        return "off".to_string();
    }
    if let Ok(directives) = dotenvy::var("SPOOL_LOG").or_else(|_| dotenvy::var("RUST_LOG"))
        && !directives.trim().is_empty()
    {
        return directives;
    }
    if verbose {
        "debug".to_string()
    } else if quiet {
        "error".to_string()
    } else {
        "info".to_string()
    }
}

/// Install the global subscriber writing to stderr. A second call is a no-op.
pub fn init_logging(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_new(log_filter(verbose, quiet))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .with_target(false),
        )
        .try_init();
}
