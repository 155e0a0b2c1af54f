//! Operator tool
//!
//! Device listing, timer precision checks, a two-participant sync run and
//! template resolution from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dyadic_sync::{
    audio::list_output_devices,
    clock::{signed_ms, Clock, MainLoop, TimerResolutionGuard},
    config::SyncConfig,
    markers::{describe, format_marker_display, resolve, ContextValue, MarkerCatalog, TrialContext},
    media::FfmpegBackend,
    playback::{prepare_all, PlaybackUnit, SyncCoordinator},
};

#[derive(Parser, Debug)]
#[command(name = "dyadsync", version)]
#[command(about = "Synchronized two-participant A/V playback and marker tools")]
struct Cli {
    /// Configuration file (defaults to the per-user config location)
    #[arg(long, global = true, env = "DYADSYNC_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List audio output devices
    Devices,

    /// Measure wait_until precision
    WaitTest {
        #[arg(long, default_value_t = 50)]
        trials: usize,

        /// Lead time per trial in milliseconds
        #[arg(long, default_value_t = 50)]
        lead_ms: u64,
    },

    /// Prepare two videos and start them together
    Play {
        video1: PathBuf,
        device1: String,
        video2: PathBuf,
        device2: String,

        /// Lead time between arming and start
        #[arg(long)]
        prep_ms: Option<f64>,

        /// Write the sync report(s) to a JSON file
        #[arg(long, value_name = "FILE")]
        telemetry: Option<PathBuf>,
    },

    /// Resolve a marker template
    Resolve {
        template: String,

        #[arg(long)]
        trial: Option<i64>,

        #[arg(long)]
        response: Option<i64>,

        /// Extra context variable, `name=value`
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::load_or_default()?,
    };

    match cli.command {
        Command::Devices => devices(),
        Command::WaitTest { trials, lead_ms } => wait_test(&config, trials, lead_ms),
        Command::Play {
            video1,
            device1,
            video2,
            device2,
            prep_ms,
            telemetry,
        } => play(&config, [(video1, device1), (video2, device2)], prep_ms, telemetry),
        Command::Resolve {
            template,
            trial,
            response,
            vars,
        } => resolve_template(&template, trial, response, &vars),
    }
}

fn devices() -> Result<()> {
    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
    Ok(())
}

fn wait_test(config: &SyncConfig, trials: usize, lead_ms: u64) -> Result<()> {
    if trials == 0 {
        bail!("--trials must be at least 1");
    }
    let _resolution = TimerResolutionGuard::new();
    let clock = Clock::new(&config.timing);

    let mut errors: Vec<f64> = (0..trials)
        .map(|_| {
            let target = clock.now() + Duration::from_millis(lead_ms);
            let observed = clock.wait_until(target);
            signed_ms(observed, target)
        })
        .collect();
    errors.sort_by(|a, b| a.total_cmp(b));

    let within = errors.iter().filter(|e| e.abs() < 5.0).count();
    let pick = |q: f64| errors[((errors.len() - 1) as f64 * q).round() as usize];
    println!("Trials:        {}", trials);
    println!("Median error:  {:.4}ms", pick(0.5));
    println!("P95 error:     {:.4}ms", pick(0.95));
    println!("Max error:     {:.4}ms", errors[errors.len() - 1]);
    println!(
        "Within 5ms:    {}/{} ({:.1}%)",
        within,
        trials,
        within as f64 * 100.0 / trials as f64
    );
    Ok(())
}

fn play(
    config: &SyncConfig,
    inputs: [(PathBuf, String); 2],
    prep_ms: Option<f64>,
    telemetry: Option<PathBuf>,
) -> Result<()> {
    let backend = Arc::new(FfmpegBackend::new(config.media.clone()));
    let mut units: Vec<PlaybackUnit> = inputs
        .into_iter()
        .enumerate()
        .map(|(i, (video, device))| {
            PlaybackUnit::new(video, device, backend.clone()).with_label(format!("P{}", i + 1))
        })
        .collect();

    let results = prepare_all(&mut units);
    for (unit, result) in units.iter().zip(results) {
        result.with_context(|| format!("preparing {}", unit.label()))?;
    }

    let prep_time = match prep_ms {
        Some(ms) if ms.is_finite() && (0.0..=3_600_000.0).contains(&ms) => Duration::from_secs_f64(ms / 1000.0),
        Some(ms) => bail!("invalid --prep-ms {}", ms),
        None => config.timing.default_prep_time(),
    };
    let longest = units
        .iter()
        .filter_map(|u| u.media_info().map(|i| i.duration))
        .max()
        .unwrap_or_default();

    let _resolution = TimerResolutionGuard::new();
    let mut main_loop = MainLoop::new(Clock::new(&config.timing));
    let coordinator = SyncCoordinator::from_config(config, main_loop.handle());

    let mut pending = coordinator.play_synchronized(&mut units, prep_time)?;
    let Some(target) = pending.target() else {
        bail!("nothing to play");
    };

    let verify_by = target + config.timing.verification_delay() + Duration::from_millis(50);
    main_loop.run_until(verify_by);
    match pending.try_report() {
        Some(report) => println!("{}", serde_json::to_string_pretty(report)?),
        None => tracing::warn!("Verification did not run before {:?}", verify_by - target),
    }

    main_loop.run_until(target + longest);
    for unit in units.iter_mut() {
        unit.stop();
    }

    if let Some(path) = telemetry {
        coordinator.telemetry().export_json(&path)?;
    }
    Ok(())
}

fn resolve_template(template: &str, trial: Option<i64>, response: Option<i64>, vars: &[String]) -> Result<()> {
    let mut context = TrialContext::new();
    if let Some(trial) = trial {
        context.set("trial_index", trial);
    }
    for var in vars {
        let Some((name, value)) = var.split_once('=') else {
            bail!("expected NAME=VALUE, got '{}'", var);
        };
        let value = match value.parse::<i64>() {
            Ok(n) => ContextValue::Int(n),
            Err(_) => ContextValue::Text(value.to_string()),
        };
        context.set(name, value);
    }

    let marker = resolve(template, &context, response)?;
    let catalog = MarkerCatalog::with_defaults();
    let name = catalog.get(&marker).map(|d| d.name.as_str());
    println!("{}", describe(template));
    println!("{}", format_marker_display(&marker, name));
    Ok(())
}
