//! CLI entry point for the NC-AFM acquisition core
//!
//! Drives an [`AcquisitionSession`] from the command line:
//! - Read and write named parameters through the host control software
//! - Send raw host commands
//! - Stream scope channels from the acquisition driver
//! - Hold Z through the topography DAC while feedback is disabled
//! - Run step tests, optionally with the scope recording alongside
//!
//! # Usage
//!
//! ```bash
//! ncafm set amp_ref 0.08
//! ncafm scope --channels QPlusAmpl,Drive --duration-ms 500
//! ncafm set feedback_enable 0 && ncafm dac Topo 1.5
//! ncafm step-test --parameter amp_ref --amplitude 0.02 --steps 6 --scope
//! ```
//!
//! With no configuration file the simulated host and scope are used.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use ncafm_core::config::CoreConfig;
use ncafm_core::driver::{channel_info, lookup_channel, ChannelId, CHANNEL_TABLE};
use ncafm_core::logging;
use ncafm_core::sequencer::{correlate_samples, StepPattern};
use ncafm_core::session::{scope_stream, AcquisitionSession, ScopeEvent};
use ncafm_core::ChannelSample;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Parser)]
#[command(name = "ncafm")]
#[command(about = "NC-AFM instrument communication and acquisition core", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/ncafm.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print parameters, acknowledgements and step events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known parameters
    Params,

    /// Read a parameter
    Get { name: String },

    /// Write a parameter
    Set { name: String, value: f64 },

    /// Send a raw command to the host software and print the reply
    Raw { text: String },

    /// Read one channel through the host software
    Channel {
        #[arg(allow_hyphen_values = true)]
        index: ChannelId,
    },

    /// List the acquisition driver's channel table
    Channels,

    /// Write an output channel through the acquisition driver (the
    /// topography DAC; disable feedback first to hold Z)
    Dac {
        /// Channel name or index
        #[arg(allow_hyphen_values = true)]
        channel: String,
        #[arg(allow_hyphen_values = true)]
        value: f64,
    },

    /// Stream scope channels and print per-channel statistics
    Scope {
        /// Channel names or indices (configured defaults when omitted)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        channels: Vec<String>,

        #[arg(long, default_value = "1000")]
        duration_ms: u64,
    },

    /// Run a step test on one parameter
    StepTest {
        #[arg(long)]
        parameter: String,

        /// Baseline value (current value when omitted)
        #[arg(long, allow_hyphen_values = true)]
        baseline: Option<f64>,

        #[arg(long)]
        amplitude: f64,

        #[arg(long, default_value = "4")]
        steps: u32,

        #[arg(long)]
        hold_ms: Option<u64>,

        #[arg(long)]
        settle_ms: Option<u64>,

        /// alternating or unipolar
        #[arg(long)]
        pattern: Option<StepPattern>,

        /// Record the scope during the test and print per-step means
        #[arg(long)]
        scope: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoreConfig::load_validated(path)?,
        None => {
            let config = CoreConfig::load()?;
            config.validate()?;
            config
        }
    };
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    if let Commands::Channels = cli.command {
        print_channel_table();
        return Ok(());
    }

    let session = AcquisitionSession::open(config)
        .await
        .context("Failed to connect to the instrument")?;

    let result = run(&session, cli.command, cli.json).await;
    session.disconnect().await?;
    result
}

async fn run(session: &AcquisitionSession, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Params => {
            for param in session.parameters() {
                if json {
                    print_json(&param)?;
                    continue;
                }
                let value = if param.address.is_readable() {
                    match session.get_parameter(&param.name).await {
                        Ok(value) => format!("{value}"),
                        Err(e) => format!("<{e}>"),
                    }
                } else {
                    "<write-only>".to_string()
                };
                println!(
                    "{:<12} {:<8} {:<28} {} {}",
                    param.name,
                    param.address.to_string(),
                    param.label,
                    value,
                    param.unit.unwrap_or_default()
                );
            }
        }
        Commands::Get { name } => {
            println!("{}", session.get_parameter(&name).await?);
        }
        Commands::Set { name, value } => {
            let ack = session.set_parameter(&name, value).await?;
            if json {
                return print_json(&ack);
            }
            println!(
                "{} = {} (acknowledged after {:?})",
                ack.parameter,
                ack.value,
                ack.acknowledged_at
                    .as_duration()
                    .saturating_sub(ack.issued_at.as_duration())
            );
        }
        Commands::Raw { text } => {
            println!("{}", session.send_raw_command(&text).await?);
        }
        Commands::Channel { index } => {
            println!("{}", session.read_channel(index).await?);
        }
        Commands::Channels => print_channel_table(),
        Commands::Dac { channel, value } => {
            let info = lookup_channel(&channel)
                .with_context(|| format!("Unknown channel '{channel}'"))?;
            let counts = session.write_output(info.index, value).await?;
            println!("{} = {value} {} ({counts} counts)", info.name, info.unit);
        }
        Commands::Scope {
            channels,
            duration_ms,
        } => {
            let channels = resolve_channels(&channels)?;
            let samples =
                record_scope(session, &channels, Duration::from_millis(duration_ms)).await?;
            print_scope_summary(&samples);
        }
        Commands::StepTest {
            parameter,
            baseline,
            amplitude,
            steps,
            hold_ms,
            settle_ms,
            pattern,
            scope,
        } => {
            let baseline = match baseline {
                Some(value) => value,
                None => session
                    .get_parameter(&parameter)
                    .await
                    .with_context(|| format!("Failed to read baseline of {parameter}"))?,
            };
            let mut plan = session
                .config()
                .step_plan(parameter, baseline, amplitude, steps);
            if let Some(hold) = hold_ms {
                plan.hold = Duration::from_millis(hold);
            }
            if let Some(settle) = settle_ms {
                plan.settle = Duration::from_millis(settle);
            }
            if let Some(pattern) = pattern {
                plan.pattern = pattern;
            }

            run_step_test(session, plan, scope, json).await?;
        }
    }
    Ok(())
}

async fn run_step_test(
    session: &AcquisitionSession,
    plan: ncafm_core::StepTestPlan,
    with_scope: bool,
    json: bool,
) -> Result<()> {
    let collector = if with_scope {
        let events = scope_stream(session.start_scope(&[]).await?);
        Some(tokio::spawn(collect_samples(events)))
    } else {
        None
    };

    println!(
        "Step test on {}: {:?}, hold {:?}",
        plan.parameter,
        plan.targets(),
        plan.hold
    );
    let handle = session.start_step_test(plan).await?;
    let report = handle.wait().await?;

    if with_scope {
        session.stop_scope().await?;
    }
    let samples = match collector {
        Some(task) => task.await?,
        None => Vec::new(),
    };

    for event in &report.events {
        if json {
            print_json(event)?;
            continue;
        }
        println!(
            "  {:?} #{:<2} target {:<10} acked at {:?}",
            event.kind,
            event.index,
            event.target,
            event.acknowledged_at.as_duration()
        );
    }
    println!("Outcome: {:?}", report.outcome);

    if with_scope {
        let calibration = session
            .clock_calibration()
            .unwrap_or_else(|| session.calibrate_clocks());
        for window in correlate_samples(&report.events, &samples, &calibration) {
            print!("  step {:<2}", window.event.index);
            for (channel, mean) in channel_means(&window.samples) {
                let name = channel_info(channel).map_or("?", |info| info.name);
                print!("  {name}={mean:.6}");
            }
            println!("  ({} samples)", window.samples.len());
        }
    }

    if !report.is_completed() {
        bail!("Step test did not complete");
    }
    Ok(())
}

async fn record_scope(
    session: &AcquisitionSession,
    channels: &[ChannelId],
    duration: Duration,
) -> Result<Vec<ChannelSample>> {
    let collector = tokio::spawn(collect_samples(scope_stream(
        session.start_scope(channels).await?,
    )));
    tokio::time::sleep(duration).await;
    session.stop_scope().await?;
    Ok(collector.await?)
}

/// Collect scope samples until the scope stops.
async fn collect_samples(events: impl Stream<Item = ScopeEvent>) -> Vec<ChannelSample> {
    let mut events = std::pin::pin!(events);
    let mut samples = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            ScopeEvent::Sample(sample) => samples.push(sample),
            ScopeEvent::Stopped => break,
            ScopeEvent::Terminated(error) => {
                warn!(error = %error, "Scope terminated");
                break;
            }
        }
    }
    samples
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn resolve_channels(keys: &[String]) -> Result<Vec<ChannelId>> {
    keys.iter()
        .map(|key| {
            lookup_channel(key)
                .map(|info| info.index)
                .with_context(|| format!("Unknown channel '{key}'"))
        })
        .collect()
}

/// Mean scaled value per channel.
fn channel_means(samples: &[ChannelSample]) -> BTreeMap<ChannelId, f64> {
    let mut sums: BTreeMap<ChannelId, (f64, usize)> = BTreeMap::new();
    for sample in samples {
        let scale = channel_info(sample.channel).map_or(1.0, |info| info.scale);
        let entry = sums.entry(sample.channel).or_default();
        entry.0 += sample.raw as f64 * scale;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(channel, (sum, count))| (channel, sum / count as f64))
        .collect()
}

fn print_scope_summary(samples: &[ChannelSample]) {
    let counts = samples.iter().fold(BTreeMap::new(), |mut acc, s| {
        *acc.entry(s.channel).or_insert(0usize) += 1;
        acc
    });
    for (channel, mean) in channel_means(samples) {
        let info = channel_info(channel);
        println!(
            "{:<12} {:>4}  mean {:>14.6} {}  ({} samples)",
            info.map_or("?", |i| i.name),
            channel,
            mean,
            info.map_or("", |i| i.unit),
            counts.get(&channel).copied().unwrap_or(0)
        );
    }
}

fn print_channel_table() {
    for info in CHANNEL_TABLE {
        println!(
            "{:<12} {:>4}  {:<8} {:<4} {:e}",
            info.name, info.index, info.label, info.unit, info.scale
        );
    }
}
