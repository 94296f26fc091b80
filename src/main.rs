mod error;
mod feed;
mod graph;
mod layout;
mod pipeline;
mod util;
mod window;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use feed::{DEFAULT_ENDPOINT, SessionConfig};
use layout::LayoutConfig;
use pipeline::{PipelineCommand, PipelineConfig, RendererEvent};

/// Streams live BGP updates into a laid-out graph, one JSON event per line on
/// stdout. Commands (`start`, `stop`, `reconnect`, `clear`, `quit`) are read
/// from stdin.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "BGP_LIVEGRAPH_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    #[arg(long, env = "BGP_LIVEGRAPH_COLLECTOR", default_value = "rrc00")]
    collector: String,
    /// Only receive updates for this prefix.
    #[arg(long, env = "BGP_LIVEGRAPH_PREFIX")]
    prefix: Option<String>,
    #[arg(long, env = "BGP_LIVEGRAPH_WINDOW_LIMIT", default_value_t = 50)]
    window_limit: usize,
    #[arg(long, env = "BGP_LIVEGRAPH_RECONNECT_DELAY_MS", default_value_t = 4000)]
    reconnect_delay_ms: u64,
    /// `0` rebuilds the graph on every batch.
    #[arg(long, env = "BGP_LIVEGRAPH_REBUILD_DELAY_MS", default_value_t = 1500)]
    rebuild_delay_ms: u64,
    /// Keep the window in a SQLite file so it survives restarts.
    #[arg(long, env = "BGP_LIVEGRAPH_STORE")]
    store: Option<PathBuf>,
    #[arg(long, env = "BGP_LIVEGRAPH_MAX_LAYOUT_ITERATIONS", default_value_t = 300)]
    max_layout_iterations: usize,
    #[arg(long, env = "BGP_LIVEGRAPH_LOG_FILTER", default_value = "info")]
    log_filter: String,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            session: SessionConfig {
                endpoint: self.endpoint.clone(),
                collector: self.collector.clone(),
                prefix: self.prefix.clone(),
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            },
            layout: LayoutConfig {
                max_iterations: self.max_layout_iterations,
                ..LayoutConfig::default()
            },
            window_limit: self.window_limit,
            rebuild_delay: Duration::from_millis(self.rebuild_delay_ms),
            store: self.store.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_filter)
        .with_context(|| format!("invalid log filter `{}`", args.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.pipeline_config();
    info!(
        endpoint = %config.session.endpoint,
        collector = %config.session.collector,
        window = config.window_limit,
        durable = config.store.is_some(),
        "starting bgp-livegraph"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_events(event_rx));
    let reader = tokio::spawn(read_commands(command_tx, event_tx.clone()));

    pipeline::run(config, command_rx, event_tx).await;

    reader.abort();
    writer.await.context("renderer writer task failed")??;
    Ok(())
}

async fn read_commands(
    commands: mpsc::UnboundedSender<PipelineCommand>,
    events: mpsc::UnboundedSender<RendererEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "could not read command input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<PipelineCommand>() {
            Ok(command) => {
                debug!(?command, "command received");
                // a pending stdin read would hold up runtime shutdown
                if commands.send(command).is_err() || command == PipelineCommand::Quit {
                    break;
                }
            }
            Err(unknown) => {
                if events.send(RendererEvent::error(unknown)).is_err() {
                    debug!("renderer stream closed");
                }
            }
        }
    }
}

async fn write_events(mut events: mpsc::UnboundedReceiver<RendererEvent>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event).context("could not encode renderer event")?;
        line.push(b'\n');
        stdout
            .write_all(&line)
            .await
            .context("could not write renderer event")?;
        stdout.flush().await.context("could not flush renderer stream")?;
    }
    Ok(())
}
