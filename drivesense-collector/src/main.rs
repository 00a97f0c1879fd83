//! drivesense command-line driver
//!
//! Finds an ELM327 adapter, initialises it, reports what the car supports
//! and polls engine parameters with periodic statistics.
//!
//! Usage: cargo run -p drivesense-collector -- [OPTIONS] <COMMAND>

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use drivesense_elm327_lib::{CanAddressing, Elm327Emulator, SimulatedVehicle};
use drivesense_obd::transport::{MockReply, MockTransport};
use drivesense_obd::{
    decode_value, CollectionFlag, Config, MonitoredParameters, Parameter, PollStats, Poller,
    Session, ValueStore,
};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "drivesense")]
#[command(about = "Collect engine data from an ELM327 OBD-II adapter")]
struct Args {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Talk to an in-process emulated adapter instead of real hardware
    #[arg(short, long, global = true)]
    mock: bool,

    /// With --mock: 29-bit CAN addressing
    #[arg(long, global = true, requires = "mock")]
    mock_extended: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List nearby Bluetooth LE peripherals
    #[cfg(feature = "ble")]
    Scan {
        /// How long to scan in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },

    /// Initialise the adapter and report the parameters the car supports
    Probe,

    /// Poll the monitored parameters
    Collect {
        /// Seconds to collect for (0 = run forever)
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Interval between stats printouts in seconds
        #[arg(short, long, default_value = "1")]
        interval: f64,

        /// Print every value at each interval
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the effective configuration as JSON
    ShowConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn init_logging(config: &Config) {
    // RUST_LOG overrides the configured level
    env_logger::Builder::new()
        .filter_level(config.log_level.as_level_filter())
        .parse_default_env()
        .init();
}

async fn open_session(args: &Args, config: Config) -> anyhow::Result<Session> {
    if !args.mock {
        return Ok(Session::connect(config).await?);
    }

    let vehicle = SimulatedVehicle {
        addressing: if args.mock_extended {
            CanAddressing::Extended
        } else {
            CanAddressing::Standard
        },
        ..SimulatedVehicle::default()
    };
    let mut emulator = Elm327Emulator::new(vehicle);
    let started = Instant::now();
    let transport = MockTransport::new(move |command| {
        MockReply::Respond(emulator.respond(command, started.elapsed()))
    });
    Ok(Session::with_transport(Arc::new(transport), config)?)
}

#[cfg(feature = "ble")]
async fn scan(config: &Config, duration: u64) -> anyhow::Result<()> {
    use drivesense_obd::config::BleConfig;
    use drivesense_obd::TransportConfig;

    let profile = match &config.transport {
        TransportConfig::Ble(ble) => ble.profile(),
        TransportConfig::Tcp(_) => BleConfig::default().profile(),
    };
    let found = drivesense_obd::transport::ble::scan(Duration::from_secs(duration), profile, |p| {
        println!(
            "  {} {:<20} rssi {:>4} {}",
            p.id,
            p.name.as_deref().unwrap_or("(unnamed)"),
            p.rssi.map_or_else(|| "?".to_string(), |r| r.to_string()),
            if p.advertises_obd_service { "OBD" } else { "" }
        );
    })
    .await?;
    println!("\n{} peripherals found", found.len());
    Ok(())
}

async fn probe(mut session: Session) -> anyhow::Result<()> {
    let available = session.start().await?;

    if let Some(bitmap) = session.availability() {
        let pids: Vec<String> = bitmap.supported_pids().iter().map(|p| format!("{p:02X}")).collect();
        println!("Supported PIDs: {}", pids.join(" "));
    }

    println!("\n=== Available parameters ===");
    for parameter in available {
        let command = parameter.command();
        match session.dispatcher().query(&command).await {
            Ok(response) => {
                let value = decode_value(parameter, &response);
                println!("{:<32} {value:>10.2} {}", parameter.name(), parameter.unit());
            }
            Err(e) => println!("{:<32} {e}", parameter.name()),
        }
    }

    session.disconnect().await;
    Ok(())
}

/// Interval bookkeeping for the periodic printout
struct Progress {
    interval_start: Instant,
    interval_successes: u64,
    interval_errors: u64,
}

impl Progress {
    fn new() -> Self {
        Self {
            interval_start: Instant::now(),
            interval_successes: 0,
            interval_errors: 0,
        }
    }

    fn print_interval(&mut self, stats: &PollStats, store: &ValueStore, verbose: bool) {
        let elapsed = self.interval_start.elapsed();
        let successes = stats.successes - self.interval_successes;
        let errors = stats.total_errors() - self.interval_errors;
        #[allow(clippy::cast_precision_loss)] // counts won't approach 2^53
        let rate = successes as f64 / elapsed.as_secs_f64();

        if verbose {
            println!(
                "  {rate:.1} values/s | {successes} values | {errors} errors | {} cycles",
                stats.cycles
            );
            for (parameter, value) in store.snapshot() {
                println!("    {:<32} {value:>10.2} {}", parameter.name(), parameter.unit());
            }
        } else {
            print!(
                "\r  {rate:.1} values/s | {} total | {} errors",
                stats.successes,
                stats.total_errors()
            );
            std::io::stdout().flush().ok();
        }

        self.interval_successes = stats.successes;
        self.interval_errors = stats.total_errors();
        self.interval_start = Instant::now();
    }
}

fn print_summary(stats: &PollStats, total_elapsed: Duration) {
    println!("\n\n=== Collection Summary ===");
    println!("Total time:     {:.2}s", total_elapsed.as_secs_f64());
    println!("Cycles:         {}", stats.cycles);
    println!("Values:         {}", stats.successes);
    println!("Unavailable:    {}", stats.unavailable);
    println!("Errors:         {}", stats.total_errors());
    for (kind, count) in &stats.errors {
        println!("  {kind:<14}{count}");
    }

    if stats.successes > 0 {
        #[allow(clippy::cast_precision_loss)] // successes won't approach 2^53
        let rate = stats.successes as f64 / total_elapsed.as_secs_f64();
        println!("Value rate:     {rate:.1} values/s");
    }

    if !stats.last_values.is_empty() {
        println!("\nLast values:");
        for (parameter, value) in &stats.last_values {
            println!("  {:<32} {value:>10.2} {}", parameter.name(), parameter.unit());
        }
    }
}

async fn collect(
    mut session: Session,
    duration: u64,
    interval: f64,
    verbose: bool,
) -> anyhow::Result<()> {
    let available = session.start().await?;

    let (monitored, skipped): (Vec<Parameter>, Vec<Parameter>) = session
        .config()
        .monitored
        .iter()
        .copied()
        .partition(|p| available.contains(p));
    for parameter in &skipped {
        warn!("{parameter} is not supported by this car, skipping");
    }
    if monitored.is_empty() {
        anyhow::bail!("None of the monitored parameters are supported");
    }

    let store = ValueStore::new();
    let active = CollectionFlag::new();
    let poller = Arc::new(session.poller(
        MonitoredParameters::new(monitored),
        active.clone(),
        Arc::new(store.clone()),
    ));

    println!(
        "Collecting{}...\n",
        if duration > 0 {
            format!(" for {duration}s")
        } else {
            " (press Ctrl+C to stop)".to_string()
        }
    );

    active.start();
    let start = Instant::now();
    let run = tokio::spawn({
        let poller: Arc<Poller> = poller.clone();
        async move { poller.run().await }
    });

    let deadline = (duration > 0).then(|| start + Duration::from_secs(duration));
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval.max(0.1)));
    ticker.tick().await;
    let mut progress = Progress::new();

    while !run.is_finished() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        ticker.tick().await;
        progress.print_interval(&poller.stats(), &store, verbose);
    }

    active.stop();
    let stats = run.await.context("Polling task failed")?;
    print_summary(&stats, start.elapsed());

    session.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_ref())?;
    init_logging(&config);
    config.validate();

    match &args.command {
        #[cfg(feature = "ble")]
        Command::Scan { duration } => scan(&config, *duration).await,
        Command::Probe => {
            let session = open_session(&args, config).await?;
            probe(session).await
        }
        Command::Collect {
            duration,
            interval,
            verbose,
        } => {
            let session = open_session(&args, config).await?;
            collect(session, *duration, *interval, *verbose).await
        }
        Command::ShowConfig => {
            info!("Effective configuration:");
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
