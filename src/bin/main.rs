use serde::Serialize;
use std::{
    error::Error,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use procpulse::{
    cli::{Cli, Commands, parse_args},
    constants::POLL_SLEEP_STEP,
    history::HistoryQuery,
    publisher::{ChannelObserver, ObserverSet, PublisherOptions, SnapshotPublisher},
    telemetry::Telemetry,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let telemetry = Telemetry::load(args.config.as_deref())?;

    match args.command {
        Commands::Status { name, health } => match name {
            Some(name) => print_json(&telemetry.status(&name, health))?,
            None => print_json(&telemetry.status_snapshot(health))?,
        },
        Commands::Metrics { external } => {
            let limit = external.unwrap_or(telemetry.config().metrics.external_limit);
            print_json(&telemetry.metrics_snapshot(limit)?)?;
        }
        Commands::History {
            since,
            full,
            limit,
            bucket,
            max_points,
        } => {
            let defaults = telemetry.history_query();
            let query = HistoryQuery {
                since,
                full,
                limit: limit.unwrap_or(defaults.limit),
                bucket_seconds: bucket.or(defaults.bucket_seconds),
                max_points: max_points.or(defaults.max_points),
                ..defaults
            };
            print_json(&telemetry.history(&query))?;
        }
        Commands::Watch {
            interval,
            health,
            record,
            count,
        } => {
            let interval =
                interval.unwrap_or(telemetry.config().watch.interval_secs);
            watch(telemetry, interval, health, record, count)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the JSON output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn watch(
    telemetry: Telemetry,
    interval_secs: f64,
    include_health: bool,
    record: bool,
    count: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let recorder = if record {
        Some(telemetry.history_writer()?)
    } else {
        None
    };
    let options = PublisherOptions {
        include_health,
        external_limit: telemetry.config().metrics.external_limit,
        recorder,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })?;

    let observers = Arc::new(ObserverSet::new());
    let (observer, receiver) = ChannelObserver::new();
    observers.connect(Arc::new(observer));

    let interval = Duration::try_from_secs_f64(interval_secs.max(0.0)).unwrap_or_default();
    let publisher = SnapshotPublisher::spawn_with_observers(
        Arc::new(telemetry),
        observers,
        interval,
        options,
    );

    let mut printed = 0usize;
    while !stop.load(Ordering::SeqCst) {
        match receiver.recv_timeout(POLL_SLEEP_STEP) {
            Ok(payload) => {
                println!("{payload}");
                printed += 1;
                if count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("snapshot stream closed");
                break;
            }
        }
    }

    info!("stopping after {printed} snapshot(s)");
    publisher.stop();
    Ok(())
}
