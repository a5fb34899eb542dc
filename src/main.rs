// Demo binary - runs a scheduler with a heartbeat and a few one-shot tasks
//
// The binary installs a tracing subscriber, builds a scheduler from the command line, submits a
// repeating heartbeat plus staggered one-shot tasks, and stops after `--seconds` or on Ctrl+C.
// The final counter snapshot is printed as JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use timerloop::{BackendKind, Scheduler, SchedulerConfig, SubmitOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// Timer backend (native or portable)
    backend: BackendKind,
    /// How long to run before stopping
    run_for: Duration,
    /// Heartbeat period
    interval: Duration,
    /// Run the loop on the main thread instead of a background thread
    blocking: bool,
}

/// Parse `--key=value` / `--key value` arguments into `CliOptions`.
///
/// # Supported Arguments
/// - `--backend <native|portable>`
/// - `--seconds <n>` (default 5)
/// - `--interval-ms <n>` (default 500)
/// - `--blocking`
///
/// Unknown arguments and unparsable values are ignored and leave the default in place.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        backend: BackendKind::default(),
        run_for: Duration::from_secs(5),
        interval: Duration::from_millis(500),
        blocking: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--blocking" {
            options.blocking = true;
            continue;
        }
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), args.next()),
        };
        let Some(value) = value else { continue };
        match key.as_str() {
            "--backend" => {
                if let Ok(kind) = value.parse() {
                    options.backend = kind;
                }
            }
            "--seconds" => {
                if let Ok(secs) = value.parse() {
                    options.run_for = Duration::from_secs(secs);
                }
            }
            "--interval-ms" => {
                if let Ok(ms) = value.parse::<u64>() {
                    options.interval = Duration::from_millis(ms.max(1));
                }
            }
            _ => {}
        }
    }
    options
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = parse_cli_options();
    let config = SchedulerConfig {
        backend: options.backend,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(config)?;

    // Ctrl+C stops the loop from the signal-handling thread
    let for_signal = scheduler.clone();
    ctrlc::set_handler(move || for_signal.stop())?;

    let started = Instant::now();
    let beats = Arc::new(AtomicU64::new(0));
    let beat_counter = beats.clone();
    scheduler.schedule_repeating(options.interval, move || {
        let n = beat_counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(beat = n, elapsed_ms = elapsed_ms(started), "heartbeat");
    })?;

    for delay_ms in [0u64, 250, 1_000, 2_000] {
        scheduler.submit(
            Duration::from_millis(delay_ms),
            move || {
                info!(
                    delay_ms,
                    elapsed_ms = elapsed_ms(started),
                    "one-shot fired"
                );
            },
            SubmitOptions::once().with_auto_arm(),
        )?;
    }

    let stopper = scheduler.clone();
    scheduler.schedule_once(options.run_for, move || stopper.stop())?;

    if options.blocking {
        scheduler.run()?;
    } else {
        scheduler.start()?;
        scheduler.join()?;
    }

    info!(beats = beats.load(Ordering::Relaxed), "demo finished");
    println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
    Ok(())
}
