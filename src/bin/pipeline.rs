use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridgewatch::store::next_track_id;
use bridgewatch::{
    Config, EventLogger, EventStore, Frame, LabelNormalizer, MemoryEventStore, PgEventStore,
    TrackManager,
};

/// Detection feed in, deduplicated presence events out.
#[derive(Parser)]
#[command(name = "bridgewatch-pipeline", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Newline-delimited JSON detection feed (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Keep events in memory instead of writing to PostgreSQL
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let store: Arc<dyn EventStore> = if args.dry_run {
        info!("dry run, events are kept in memory");
        Arc::new(MemoryEventStore::new())
    } else {
        let store = PgEventStore::connect(&config.datastore)
            .await
            .context("connecting to datastore")?;
        store.ensure_schema().await.context("preparing schema")?;
        Arc::new(store)
    };

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    run(&config, store, reader).await
}

/// Drive the Track Manager and Event Logger until the feed ends.
async fn run(
    config: &Config,
    store: Arc<dyn EventStore>,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> Result<()> {
    let first_id = next_track_id(store.as_ref())
        .await
        .context("reading stored track ids")?;
    if first_id > 1 {
        info!(first_id, "continuing track ids after stored events");
    }
    let mut tracker = TrackManager::with_first_id(config.tracker.clone(), first_id);
    let mut logger = EventLogger::new(
        store,
        LabelNormalizer::with_aliases(&config.labels.aliases),
    );
    let stall_timeout = config.pipeline.stall_timeout();

    let mut lines = BufReader::new(reader).lines();
    let mut last_frame = Instant::now();
    let mut line_no: u64 = 0;

    loop {
        // next_line is cancel safe, a timeout loses no input
        let next = match tokio::time::timeout(stall_timeout, lines.next_line()).await {
            Ok(next) => next.context("reading detection feed")?,
            Err(_) => {
                let update = tracker.age_idle(last_frame.elapsed());
                logger.on_frame_update(&update).await;
                continue;
            }
        };
        let Some(line) = next else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(line = line_no, %error, "skipping malformed feed line");
                continue;
            }
        };
        last_frame = Instant::now();

        let update = tracker.step(&frame);
        logger.on_frame_update(&update).await;
    }

    let counters = logger.counters();
    info!(
        frames = tracker.frame_index(),
        written = counters.written,
        failed = counters.failed,
        "detection feed ended"
    );
    Ok(())
}
