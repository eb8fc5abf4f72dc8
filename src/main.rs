use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use enrich_pipeline::config::PipelineConfig;
use enrich_pipeline::events::{Event, EventPublisher};
use enrich_pipeline::pipeline::Pipeline;

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Enrich pipeline starting"
    );

    let db_path = config.db_path.clone();
    let pipeline = Pipeline::open(config)
        .await
        .with_context(|| format!("Failed to start pipeline with database at {}", db_path.display()))?;

    let report = pipeline.health().await;
    info!(report = %serde_json::to_string(&report)?, "Health");

    let running = pipeline.start(EVENT_BUFFER);
    let publisher = running.publisher.clone();

    // ── Event source ────────────────────────────────────────────────────
    tokio::select! {
        _ = read_stdin_events(publisher) => {
            info!("Event source closed; processing continues until interrupted");
            tokio::signal::ctrl_c().await?;
        }
        result = tokio::signal::ctrl_c() => result?,
    }

    info!("Shutting down");
    let consumer = running.shutdown().await?;

    let stats = pipeline.stats().await?;
    info!(
        pending = stats.pending,
        processing = stats.processing,
        completed = stats.completed,
        failed = stats.failed,
        events_dropped = consumer.dropped,
        "Stopped"
    );
    Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "enrich-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}

/// Publish newline-delimited JSON events from stdin until EOF. Malformed
/// lines are logged and skipped.
async fn read_stdin_events(publisher: EventPublisher) {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut line_no = 0usize;

    while let Some(line) = lines.next().await {
        line_no += 1;
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, "Skipping malformed event: {e}");
                continue;
            }
        };

        if publisher.publish(event).await.is_err() {
            warn!("Event consumer stopped; closing event source");
            break;
        }
    }
}
