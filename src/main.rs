use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use wifi_localizer::matcher::{DiagnosticMatcher, FingerprintMatcher, LocalMatcher};
use wifi_localizer::sensors::{self, ReplaySource, TermuxWifiSource};
use wifi_localizer::{
    LocalFingerprintStore, Localizer, LocalizerConfig, PublishedResults, ScanSource,
    ThreadedScanner,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Single,
    Voting,
    Continuous,
}

#[derive(Parser, Debug)]
#[command(name = "localize")]
#[command(about = "WiFi fingerprint indoor localization", long_about = None)]
struct Args {
    /// Fingerprint directory
    #[arg(long, default_value = "fingerprints")]
    db: PathBuf,

    /// Map name pattern (full match)
    #[arg(long)]
    map: Option<String>,

    #[arg(long, value_enum, default_value = "single")]
    mode: Mode,

    /// Scan frequency in Hz (0 = default)
    #[arg(long, default_value = "4")]
    frequency: u32,

    /// Voting samples (0 = until duration ends)
    #[arg(long, default_value = "0")]
    samples: u32,

    /// Duration in seconds (0 = mode default, continuous runs until Ctrl-C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Recorded scans to replay instead of the radio
    #[arg(long)]
    replay: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every per-AP comparison at trace level
    #[arg(long)]
    debug_matcher: bool,

    /// Use synthetic accelerometer data
    #[arg(long)]
    mock_accel: bool,

    /// Output directory
    #[arg(long, default_value = "localizer_sessions")]
    output_dir: PathBuf,
}

const SINGLE_SHOT_SECS: u64 = 3;
const LOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("[{}] WiFi Localizer Starting", ts_now());
    println!("  Fingerprints: {}", args.db.display());
    println!("  Map: {}", args.map.as_deref().unwrap_or("*"));
    println!("  Mode: {:?}", args.mode);
    println!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)?;

    let config = match &args.config {
        Some(path) => LocalizerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LocalizerConfig::default(),
    };

    let source: Box<dyn ScanSource> = match &args.replay {
        Some(path) => {
            let replay = ReplaySource::load(path)
                .with_context(|| format!("loading replay {}", path.display()))?;
            info!("replaying {} recorded sweeps", replay.len());
            Box::new(replay)
        }
        None => Box::new(TermuxWifiSource::new()),
    };
    let matcher: Box<dyn FingerprintMatcher> = if args.debug_matcher {
        Box::new(DiagnosticMatcher)
    } else {
        Box::new(LocalMatcher)
    };

    let scanner = Arc::new(ThreadedScanner::new(source));
    let store = Arc::new(LocalFingerprintStore::new());
    let localizer = Arc::new(Localizer::new(config, scanner, store, matcher));

    // Spawn accelerometer task feeding the motion gate
    let _accel_handle = tokio::spawn(sensors::accel_loop(localizer.motion_sender(), args.mock_accel));

    println!("[{}] Loading fingerprints...", ts_now());
    localizer.load_fingerprints(&args.db, args.map.as_deref())?;
    let load_start = Instant::now();
    while !localizer.is_ready() {
        if load_start.elapsed() > LOAD_TIMEOUT {
            anyhow::bail!("fingerprints not ready after {:?}", LOAD_TIMEOUT);
        }
        sleep(Duration::from_millis(100)).await;
    }
    println!("[{}] {} fingerprints ready", ts_now(), localizer.status().fingerprints);

    let outcome = match args.mode {
        Mode::Single => run_single(&localizer, &args).await,
        Mode::Voting => run_voting(&localizer, &args).await,
        Mode::Continuous => run_continuous(&localizer, &args).await,
    };

    let status_path = args.output_dir.join("status.json");
    if let Err(e) = localizer.status().save(&status_path) {
        warn!("could not write {}: {}", status_path.display(), e);
    }

    let shutdown = localizer.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;
    outcome
}

async fn run_single(localizer: &Arc<Localizer>, args: &Args) -> Result<()> {
    let secs = if args.duration == 0 { SINGLE_SHOT_SECS } else { args.duration };
    localizer.start_scanning_for_location(args.frequency, false, 0);
    sleep(Duration::from_secs(secs)).await;

    let handle = localizer.clone();
    tokio::task::spawn_blocking(move || handle.stop_scanning_for_location(None)).await?;
    print_results(&localizer.results(), localizer.config().max_matches);
    Ok(())
}

async fn run_voting(localizer: &Arc<Localizer>, args: &Args) -> Result<()> {
    let sample_secs = localizer.config().voting_sample_ms as f64 / 1000.0;
    localizer.start_scanning_for_location(args.frequency, true, args.samples);

    let deadline = match (args.samples, args.duration) {
        (0, 0) => Some(Duration::from_secs(SINGLE_SHOT_SECS * 5)),
        (_, 0) => None,
        (_, secs) => Some(Duration::from_secs(secs)),
    };
    println!(
        "[{}] Voting over {} samples of {:.1}s",
        ts_now(),
        if args.samples == 0 { "unbounded".to_string() } else { args.samples.to_string() },
        sample_secs
    );

    let start = Instant::now();
    loop {
        if !localizer.status().voting {
            break;
        }
        if deadline.map_or(false, |d| start.elapsed() >= d) {
            break;
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, voting on what we have", ts_now());
                break;
            }
        }
    }

    let handle = localizer.clone();
    tokio::task::spawn_blocking(move || handle.stop_scanning_for_location(None)).await?;
    print_results(&localizer.results(), localizer.config().max_matches);
    Ok(())
}

async fn run_continuous(localizer: &Arc<Localizer>, args: &Args) -> Result<()> {
    let subscription = localizer.start_continuous_positioning(args.frequency, 0);
    let start = Utc::now();
    let mut last_status = Utc::now();
    let status_path = args.output_dir.join("live_status.json");

    println!("[{}] Continuous positioning started...", ts_now());

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
        }

        if localizer.is_location_updated() {
            let results = localizer.results();
            if let Some(best) = results.best() {
                println!(
                    "[{}] {} score={:.3} at ({}, {}) {:.6},{:.6}{}",
                    ts_now(),
                    best.location_key,
                    best.score,
                    results.position.pixel.x,
                    results.position.pixel.y,
                    results.position.lat_lon.latitude,
                    results.position.lat_lon.longitude,
                    if localizer.is_device_moving() { " [moving]" } else { "" }
                );
            }
        }

        // Update live status every 2 seconds
        let now = Utc::now();
        if now.signed_duration_since(last_status).num_seconds() >= 2 {
            let _ = localizer.status().save(&status_path);
            last_status = now;
        }

        tokio::select! {
            _ = sleep(Duration::from_millis(100)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
        }
    }

    let handle = localizer.clone();
    tokio::task::spawn_blocking(move || handle.stop_continuous_positioning(subscription)).await?;
    print_results(&localizer.results(), localizer.config().max_matches);
    Ok(())
}

fn print_results(results: &PublishedResults, max: usize) {
    println!("\n=== Results ===");
    if results.ranked.is_empty() {
        println!("No matching location");
        return;
    }
    for (location, score) in results.locations(max).iter().zip(results.proximities(max)) {
        println!("  {:<32} {:.3}", location, score);
    }
    println!(
        "Position: ({}, {})  lat/lon: {:.6}, {:.6}",
        results.position.pixel.x,
        results.position.pixel.y,
        results.position.lat_lon.latitude,
        results.position.lat_lon.longitude
    );
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
