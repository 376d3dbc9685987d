mod stats;

use std::collections::BTreeMap;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use hls_ingest::{Dequeued, IngestConfig, LiveSession, SessionEvent, SessionEvents, StreamType};
use tokio::time::Instant;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::stats::{Report, StreamStats};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the master or media playlist
    url: String,

    /// Stop after this many seconds of wall-clock time
    #[arg(short, long)]
    duration: Option<u64>,

    /// Seek to this position (seconds) once prepared
    #[arg(long)]
    seek: Option<f64>,

    /// Select the alternative rendition at this index once prepared
    #[arg(long)]
    track: Option<usize>,

    /// Stay on the initial variant
    #[arg(long)]
    no_adaptive: bool,

    /// Print every access unit
    #[arg(long)]
    dump: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = IngestConfig::default();
    config.bandwidth.adaptive = !args.no_adaptive;

    let (session, events) = LiveSession::with_http(config).context("Failed to build HTTP client")?;
    let (prepared_tx, mut prepared) = tokio::sync::watch::channel(false);
    let printer = tokio::spawn(print_events(events, prepared_tx));

    session
        .connect(&args.url)
        .await
        .with_context(|| format!("Failed to open {}", args.url))?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut stats: BTreeMap<StreamType, StreamStats> = BTreeMap::new();
    let mut adjusted = false;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Time limit reached");
            break;
        }
        if !adjusted && *prepared.borrow_and_update() {
            adjusted = true;
            apply_adjustments(&session, &args).await?;
        }

        let active = session.active_streams();
        let mut progressed = false;
        let mut failure = None;
        for stream in active.types() {
            let entry = stats.entry(stream).or_default();
            if entry.finished {
                continue;
            }
            match session.dequeue_access_unit(stream) {
                Dequeued::Unit(unit) => {
                    if args.dump {
                        println!(
                            "{stream} ts={} bytes={} sync={} seq={}",
                            unit.timestamp_us,
                            unit.data.len(),
                            unit.is_sync,
                            unit.segment_seq
                        );
                    }
                    entry.record_unit(&unit);
                    progressed = true;
                }
                Dequeued::Discontinuity(discontinuity) => {
                    debug!(%stream, ?discontinuity, "Discontinuity");
                    entry.record_discontinuity(&discontinuity);
                    progressed = true;
                }
                Dequeued::WouldBlock => {}
                Dequeued::EndOfStream => {
                    info!(%stream, "End of stream");
                    entry.finished = true;
                }
                Dequeued::Error(err) => {
                    entry.finished = true;
                    failure = Some(err);
                }
            }
        }
        if let Some(err) = failure {
            print_summary(&session, &stats);
            return Err(err).context("Ingestion failed");
        }
        if !active.is_empty() && active.types().all(|s| stats.get(&s).is_some_and(|e| e.finished)) {
            break;
        }
        if !progressed {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    session.disconnect().await?;
    print_summary(&session, &stats);
    drop(session);
    let _ = printer.await;
    Ok(())
}

async fn apply_adjustments(session: &LiveSession, args: &Args) -> anyhow::Result<()> {
    if let Some(index) = args.track {
        let tracks = session.track_info().await?;
        let track = tracks
            .get(index)
            .with_context(|| format!("No track at index {index}, {} available", tracks.len()))?;
        info!(index, name = %track.name, language = ?track.language, "Selecting track");
        session.select_track(index, true).await?;
    }
    if let Some(seek) = args.seek {
        let time_us = (seek * 1_000_000.0) as i64;
        session.seek_to(time_us).await.context("Seek failed")?;
    }
    Ok(())
}

async fn print_events(mut events: SessionEvents, prepared: tokio::sync::watch::Sender<bool>) {
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::Prepared => {
                info!("Prepared");
                let _ = prepared.send(true);
            }
            SessionEvent::PreparationFailed(err) => error!("Preparation failed: {}", err),
            SessionEvent::SourceUnsupported => error!("Not an HLS source"),
            SessionEvent::StreamsChanged { mask } => info!(streams = ?mask, "Streams changed"),
            SessionEvent::DurationUpdate(us) => {
                info!("Duration {:.3}s", us as f64 / 1_000_000.0)
            }
            SessionEvent::BufferingStart => info!("Buffering"),
            SessionEvent::BufferingEnd => info!("Buffering finished"),
            SessionEvent::MetadataDetected => info!("Timed metadata present"),
            SessionEvent::BandwidthSwitched { index, bandwidth } => {
                info!(index, bandwidth, "Switched variant")
            }
            SessionEvent::Error(err) => error!("Session error: {}", err),
        }
    }
}

fn print_summary(session: &LiveSession, stats: &BTreeMap<StreamType, StreamStats>) {
    println!();
    for (stream, stats) in stats {
        println!("{}", Report { stream: *stream, stats });
        if let Some(format) = session.stream_format(*stream) {
            println!("          format={format:?}");
        }
    }
}
