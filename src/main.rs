use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use trialvault::{
    AppConfig, AppState, LocalStaging, ReplicationPipeline, ReplicationQueue, Replicator,
    SummaryOutcome, SummaryRecorder, build_router, replay::replay_staging_file,
    store::build_remote_store,
};

#[derive(Parser)]
#[command(name = "trialvault")]
#[command(about = "Stages experiment submissions on disk and replicates them to a remote store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP backend (default).
    Serve,
    /// Replicate staging files again, in the foreground.
    Replay {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Replay { files } => replay(config, files).await,
    }
}

fn build_pipeline(config: &AppConfig) -> Result<Arc<ReplicationPipeline>> {
    let store = build_remote_store(&config.remote).context("failed to initialize remote store")?;
    info!(store = store.name(), batch_size = config.batch_size, "remote store ready");

    Ok(Arc::new(ReplicationPipeline::new(
        Replicator::new(
            store.clone(),
            config.batch_size,
            config.chunk_failure_policy,
        ),
        SummaryRecorder::new(store),
    )))
}

async fn serve(config: AppConfig) -> Result<()> {
    let pipeline = build_pipeline(&config)?;
    let queue = Arc::new(ReplicationQueue::start(
        pipeline,
        config.queue_capacity,
        config.max_in_flight,
    ));
    let staging = Arc::new(
        LocalStaging::new(config.data_dir.clone()).with_write_timeout(config.staging_timeout),
    );
    let state = AppState::new(staging, queue.clone(), config.body_limit_bytes);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        "trialvault started"
    );

    let intake_queue = queue.clone();
    let drain_secs = config.shutdown_drain.as_secs();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = stop_signal().await;
            info!(
                signal,
                pending = intake_queue.pending(),
                drain_secs,
                "stopping intake; draining replication queue"
            );
        })
        .await
        .context("server error")?;

    let report = queue.shutdown(config.shutdown_drain).await;
    if report.abandoned > 0 {
        warn!(
            abandoned = report.abandoned,
            "shut down with unreplicated submissions; run `trialvault replay` on their staging files"
        );
    } else {
        info!(completed = report.completed, "shut down cleanly");
    }

    Ok(())
}

async fn replay(config: AppConfig, files: Vec<PathBuf>) -> Result<()> {
    let pipeline = build_pipeline(&config)?;
    let mut failures = 0usize;

    for path in &files {
        match replay_staging_file(&pipeline, path).await {
            Ok(outcome) => {
                let summary = match &outcome.summary {
                    SummaryOutcome::NotApplicable => "n/a",
                    SummaryOutcome::Recorded(record) => record.status.as_str(),
                    SummaryOutcome::Failed => "summary write failed",
                };
                println!(
                    "{}: {} batches committed, {} failed, {} skipped, {} trials written (summary: {})",
                    path.display(),
                    outcome.report.batches_committed,
                    outcome.report.batches_failed,
                    outcome.report.batches_skipped,
                    outcome.report.trials_written,
                    summary
                );
                if !outcome.report.is_complete() {
                    failures += 1;
                }
            }
            Err(err) => {
                error!(error = %err, "replay failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} staging files did not replay completely", files.len());
    }
    Ok(())
}

const DEFAULT_LOG_FILTER: &str = "trialvault=debug,tower_http=info";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves with the name of the first stop signal received.
async fn stop_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                error!(error = %err, "unable to listen for ctrl+c");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
