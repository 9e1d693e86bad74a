// meshio: BLE mesh advertising bearer CLI
//
// Simulates transmit schedules against a virtual controller, decodes
// advertising reports and manages the bearer configuration.

mod config;
mod decode;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use simulate::{Simulation, TimelineEntry, TimelineKind};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "meshio")]
#[command(about = "meshio: BLE advertising bearer for mesh packets", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a transmit schedule against the virtual controller
    Simulate {
        /// JSON schedule file; the built-in demo runs when omitted
        schedule: Option<PathBuf>,
        /// Virtual time to simulate (ms)
        #[arg(short, long)]
        duration: Option<u32>,
        /// Override the configured burst mode (chained|synchronous)
        #[arg(short, long)]
        mode: Option<String>,
        /// Register a receiver for this hex filter (repeatable)
        #[arg(short, long)]
        listen: Vec<String>,
        /// Include controller bring-up in the output
        #[arg(long)]
        bring_up: bool,
        /// Print the timeline as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decode an LE Advertising Report given as hex
    Decode {
        hex: String,
        #[arg(long)]
        json: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };
    let _log_guard = init_logging(config.log_file.as_deref())?;

    match cli.command {
        Commands::Simulate {
            schedule,
            duration,
            mode,
            listen,
            bring_up,
            json,
        } => cmd_simulate(config, schedule, duration, mode, listen, bring_up, json),
        Commands::Decode { hex, json } => cmd_decode(&hex, json),
        Commands::Config { action } => cmd_config(config, action, cli.config),
    }
}

/// Console logging filtered by `RUST_LOG` (default `warn`), plus an optional
/// non-blocking file sink
fn init_logging(log_file: Option<&str>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let console = fmt::layer().with_writer(std::io::stderr).with_filter(filter());

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(console).init();
        return Ok(None);
    };

    let path = PathBuf::from(path);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .context("Log file path has no file name")?
        .to_owned();
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(Some(guard))
}

fn cmd_simulate(
    mut config: config::Config,
    schedule: Option<PathBuf>,
    duration: Option<u32>,
    mode: Option<String>,
    listen: Vec<String>,
    bring_up: bool,
    json: bool,
) -> Result<()> {
    if let Some(mode) = mode {
        config.mesh.burst_mode = mode.parse()?;
    }
    let duration = duration.unwrap_or(config.simulation.duration_ms);
    let schedule = match schedule {
        Some(path) => simulate::load_schedule(&path)?,
        None => simulate::demo_schedule(),
    };

    let mut sim = Simulation::new(&config)?;
    if !bring_up {
        sim.clear_timeline();
    }
    for filter in &listen {
        let filter = hex::decode(filter).with_context(|| format!("Invalid filter hex: {}", filter))?;
        sim.listen(&filter)?;
    }
    let timeline = sim.run(&schedule, duration)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&timeline)?);
        return Ok(());
    }

    println!(
        "{} ({} mode, {} ms)",
        "Simulation".bold(),
        config.mesh.burst_mode,
        duration
    );
    println!();
    for entry in &timeline {
        print_timeline_entry(entry);
    }
    if timeline.is_empty() {
        println!("  {}", "(nothing happened)".dimmed());
    }
    Ok(())
}

fn print_timeline_entry(entry: &TimelineEntry) {
    let at = format!("{:>6} ms", entry.at_ms).dimmed();
    match &entry.kind {
        TimelineKind::Command {
            mode, name, params, ..
        } => {
            println!("  {}  {:<6} {:<34} {}", at, mode, name.bright_cyan(), params.dimmed());
        }
        TimelineKind::Queued { id, payload } => {
            println!("  {}  {} queued #{} {}", at, "+".green(), id, payload.bright_yellow());
        }
        TimelineKind::Rejected { error } => {
            println!("  {}  {} rejected: {}", at, "✗".red(), error);
        }
        TimelineKind::Cancelled { removed } => {
            println!("  {}  {} cancelled {} packet(s)", at, "-".yellow(), removed);
        }
        TimelineKind::Received { from, rssi, data } => {
            println!(
                "  {}  {} {} from {} rssi {}",
                at,
                "←".bright_green(),
                data.bright_yellow(),
                from,
                rssi
            );
        }
    }
}

fn cmd_decode(input: &str, json: bool) -> Result<()> {
    let reports = decode::decode_hex(input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("{} ({} report(s))", "Advertising Report".bold(), reports.len());
    for report in &reports {
        println!();
        let status = if report.delivered {
            "delivered".green()
        } else {
            "ignored".dimmed()
        };
        println!(
            "  {} type {:#04x} ({})  rssi {}",
            report.addr.bright_cyan(),
            report.event_type,
            status,
            report.rssi
        );
        if report.fields.is_empty() {
            println!("    {}", "(no AD structures)".dimmed());
        }
        for field in &report.fields {
            println!(
                "    {:#04x} {:<22} {}",
                field.ad_type,
                field.name,
                field.payload.bright_yellow()
            );
        }
    }
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction, path: Option<PathBuf>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            let path = match path {
                Some(path) => path,
                None => config::Config::config_file()?,
            };
            println!("{}", path.display());
        }
    }

    Ok(())
}
