use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use metrics_crawler::config::{Config, Overrides};
use metrics_crawler::pipeline::{Coordinator, RunOutcome};
use metrics_crawler::prometheus::{build_clients, Client};
use metrics_crawler::sink::OutputSink;
use metrics_crawler::telemetry::RunMetrics;

/// Exports Prometheus range-query data to CSV, ClickHouse, or Feishu.
#[derive(Parser)]
#[command(name = "metrics-crawler", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "etc/config.yaml")]
    config: PathBuf,

    /// Comma-separated source addresses replacing the configured list.
    #[arg(long)]
    prometheus: Option<String>,

    /// Window start (RFC 3339).
    #[arg(long)]
    start: Option<String>,

    /// Window end (RFC 3339).
    #[arg(long)]
    end: Option<String>,

    /// Query resolution (e.g. 30s, 5m).
    #[arg(long)]
    step: Option<String>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum metric/source pairs processed at once.
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            prometheus: self.prometheus.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            step: self.step.clone(),
            log_level: self.log_level.clone(),
            concurrency: self.concurrency,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("metrics-crawler {}", version::full());
        return Ok(ExitCode::SUCCESS);
    }

    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_overrides(&cli.overrides())
        .context("applying command-line overrides")?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting metrics-crawler",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let window = cfg.time_range.window()?;

    let metrics = Arc::new(RunMetrics::new().context("registering run metrics")?);
    if cfg.metrics_server.enabled {
        metrics
            .start(&cfg.metrics_server.addr)
            .await
            .context("starting metrics server")?;
    }

    // Resolve sources before the sink so nothing remote is touched when none are usable.
    let clients: Vec<Client> = build_clients(&cfg.prometheus_instances)?
        .into_iter()
        .map(|client| {
            client
                .with_cancellation(cancel.clone())
                .with_metrics(Arc::clone(&metrics))
        })
        .collect();

    let sink = OutputSink::from_config(&cfg.sink)
        .await
        .context("initializing sink")?;

    let coordinator = Coordinator::new(clients, sink)?
        .with_concurrency(cfg.concurrency)
        .with_metrics(Arc::clone(&metrics));

    let result = coordinator.run(&cfg.metrics, &window, &cancel).await;
    metrics.stop();

    let report = result?;

    for failure in &report.failures {
        error!(
            metric = %failure.metric,
            source = %failure.source,
            error = %failure.error,
            "pair did not complete",
        );
    }

    match report.outcome() {
        RunOutcome::Success => {
            info!(records = report.records_written, "export complete");
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::PartialFailure => {
            error!(
                failed = report.failures.len(),
                total = report.pairs_total,
                "export finished with failures",
            );
            Ok(ExitCode::FAILURE)
        }
        RunOutcome::Cancelled => {
            warn!(
                skipped = report.pairs_skipped,
                total = report.pairs_total,
                "export cancelled",
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = terminate => {
                info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });
}
