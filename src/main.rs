//! mpflow CLI - multipath flow scenario runner.

use clap::Parser;
use colored::Colorize;

use mpflow::cli::*;
use mpflow::config::{init_logging, Config};
use mpflow::error::{Error, Result};
use mpflow::multipath::FlowSpec;
use mpflow::sim::{FlowReport, Scenario, ScenarioReport};
use mpflow::util::format_bytes;
use mpflow::{FlowId, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load config if specified
    let mut config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::example()
    };

    // Initialize logging from `[logging]` plus any flags
    cli.apply_logging(&mut config.logging);
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run(args) => run_scenario(args, config, cli.format).await,
        Commands::Inspect(args) => run_inspect(&args, &config, cli.format),
        Commands::Config(args) => run_config(&args, &config),
    }
}

fn select_flows(config: &mut Config, ids: &[u32]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    config.flows.retain(|f| ids.contains(&f.id.get()));
    if config.flows.is_empty() {
        return Err(Error::InvalidConfig(format!("No configured flow matches {ids:?}")));
    }
    Ok(())
}

/// Run the scenario
async fn run_scenario(args: RunArgs, mut config: Config, format: OutputFormat) -> Result<()> {
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(run) = args.run {
        config.simulation.run = run;
    }
    if let Some(units) = args.units {
        config.simulation.units_per_flow = units;
    }
    if args.send_interval.is_some() {
        config.simulation.send_interval = args.send_interval;
    }
    select_flows(&mut config, &args.flows)?;

    if format == OutputFormat::Text {
        println!("{} {}", "mpflow".bright_cyan().bold(), VERSION);
        println!(
            "  seed {}  run {}  {} units per flow",
            config.simulation.seed, config.simulation.run, config.simulation.units_per_flow
        );
        println!();
    }

    let report = Scenario::from_config(&config)?.run().await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print_report(&report),
    }

    if report.flows.iter().all(|f| f.in_order) {
        Ok(())
    } else {
        Err(Error::Internal("a flow delivered units out of order".into()))
    }
}

fn print_report(report: &ScenarioReport) {
    for flow in &report.flows {
        print_flow(flow);
    }
}

fn print_flow(flow: &FlowReport) {
    let status = if flow.in_order && flow.receiver.lost == 0 {
        "✓".green()
    } else {
        "✗".red()
    };
    println!(
        "{} {} ({})",
        status,
        flow.flow.to_string().bright_white().bold(),
        flow.protocol
    );
    println!(
        "    sent {}  delivered {}  deferred {}  discarded {}",
        flow.sender.stats.units_sent,
        flow.receiver.stats.delivered,
        flow.sender.stats.units_deferred,
        flow.sender.stats.units_discarded,
    );
    println!(
        "    reordered {}  peak buffered {}  lost at teardown {}",
        flow.receiver.stats.reordered, flow.receiver.stats.peak_buffered, flow.receiver.lost
    );
    if let Some(mean) = flow.summary.mean_delay {
        println!(
            "    delay mean {:?}  max {:?}  goodput {:.3} Mbit/s  ({})",
            mean,
            flow.summary.max_delay,
            flow.summary.goodput_bps() / 1e6,
            format_bytes(flow.summary.bytes_delivered)
        );
    }
    let total: u64 = flow.per_path.iter().map(|(_, n)| n).sum();
    for (path, sent) in &flow.per_path {
        let share = if total > 0 { *sent as f64 / total as f64 } else { 0.0 };
        println!("      {path}: {sent} units ({:.1}%)", share * 100.0);
    }
}

/// Show derived per-flow values
fn run_inspect(args: &InspectArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let mut config = config.clone();
    select_flows(&mut config, &args.flows)?;
    config.validate()?;

    if format == OutputFormat::Json {
        let rows: Vec<serde_json::Value> = config.flows.iter().map(inspect_json).collect();
        return print_json(&rows);
    }

    for flow in &config.flows {
        println!("{} {}", flow.id.to_string().bright_white().bold(), flow.key());
        if flow.is_zero_rate() {
            println!("    {}", "zero-rate flow, no channels are opened".yellow());
            continue;
        }
        println!(
            "    packet {} B  header {} B  payload {} B  unit {} B",
            flow.packet_size,
            flow.header_size(),
            flow.data_payload_size(),
            flow.unit_size()
        );
        println!(
            "    rate {:.3} Mbit/s  goodput {:.3} Mbit/s  send every {:?}",
            flow.data_rate_bps / 1e6,
            flow.goodput_bps() / 1e6,
            flow.transmission_interval().unwrap_or_default()
        );
        for (path, ratio) in flow.split_ratios() {
            let delay = flow.path(path).map(|p| p.delay).unwrap_or_default();
            println!("      {path}: split {ratio:.4}  delay {delay:?}");
        }
    }
    Ok(())
}

fn inspect_json(flow: &FlowSpec) -> serde_json::Value {
    serde_json::json!({
        "flow": flow.id,
        "key": flow.key().to_string(),
        "zero_rate": flow.is_zero_rate(),
        "unit_size": flow.unit_size(),
        "payload_size": flow.data_payload_size(),
        "goodput_bps": flow.goodput_bps(),
        "interval": flow.transmission_interval().map(|d| d.as_secs_f64()),
        "split_ratios": flow
            .split_ratios()
            .into_iter()
            .map(|(path, ratio)| serde_json::json!({ "path": path, "ratio": ratio }))
            .collect::<Vec<_>>(),
    })
}

/// Print, write or check configuration
fn run_config(args: &ConfigArgs, config: &Config) -> Result<()> {
    if args.check {
        config.validate()?;
        let ids: Vec<FlowId> = config.flows.iter().map(|f| f.id).collect();
        println!("{} configuration is valid ({} flows: {ids:?})", "✓".green(), ids.len());
        return Ok(());
    }

    let config = if args.example { Config::example() } else { config.clone() };
    if let Some(ref path) = args.output {
        config.save(path)?;
        println!("{} Wrote configuration to {}", "✓".green(), path.display());
    } else {
        let content = toml::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;
        print!("{content}");
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize output: {e}")))?;
    println!("{content}");
    Ok(())
}
