use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::io::IsTerminal;
use std::path::Path;
use streamboard::app::{self, RunOutput, RunPlan};
use streamboard::cli::{Cli, Commands, ConfigAction};
use streamboard::config::Config;
use streamboard::supervisor::{Outcome, abort_pair};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli);

    match &cli.command {
        Commands::Config { action } => {
            handle_config_command(action, &cli)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "streamboard",
                &mut std::io::stdout(),
            );
        }
        command => {
            if let Some(plan) = command.plan() {
                run_command(&cli, plan).await?;
            }
        }
    }

    Ok(())
}

/// Setup tracing: `RUST_LOG` wins, otherwise `-q` / `-v`.
fn setup_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("streamboard={}", cli.log_level()))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/streamboard/config.toml)
/// 3. Built-in defaults
///
/// Environment variable overrides and then CLI overrides are applied on top.
fn load_config(cli: &Cli) -> Result<Config> {
    let config = if let Some(path) = cli.config.as_deref() {
        Config::load(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    let mut config = config.with_env_overrides();
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run_command(cli: &Cli, plan: RunPlan) -> Result<()> {
    let config = load_config(cli)?;
    let mode = plan.mode();
    info!(version = %streamboard::version_string(), %mode, "starting run");

    let mut timing = config.supervisor.for_mode(mode);
    if let Some(grace) = cli.grace {
        timing.grace = grace;
    }
    if let Some(poll) = cli.poll_interval {
        timing.poll_interval = poll;
    }

    let (abort, signal) = abort_pair();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                abort.abort();
            }
            Err(e) => warn!("failed to listen for Ctrl+C: {}", e),
        }
    });

    let output = tokio::task::spawn_blocking(move || app::run(&config, &plan, timing, signal))
        .await
        .context("supervisor task failed")??;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&output);
    }
    // An aborted run is a clean exit
    Ok(())
}

fn print_summary(output: &RunOutput) {
    let color = std::io::stdout().is_terminal();
    let report = &output.report;

    let outcome = match report.outcome {
        Outcome::Completed => "completed",
        Outcome::Aborted => "aborted",
    };
    if color {
        match report.outcome {
            Outcome::Completed => println!("{} run {}", output.mode, outcome.green().bold()),
            Outcome::Aborted => println!("{} run {}", output.mode, outcome.yellow().bold()),
        }
    } else {
        println!("{} run {}", output.mode, outcome);
    }

    let states: Vec<String> = report.states().iter().map(|s| s.to_string()).collect();
    println!("  states:   {}", states.join(" -> "));
    println!("  elapsed:  {} ms", report.elapsed_ms);
    println!("  observed: {} chunks", report.chunks_observed);
    if let Some(terminal) = report.terminal {
        println!("  terminal: {}", terminal);
    }
    println!("  stages:   {}", output.start_order.join(", "));
    for (key, count) in &output.collected {
        println!("  {:<28} {}", key, count);
    }
    if let Some(cache) = &output.cache {
        println!(
            "  cache:    {} chunks, {} samples",
            cache.chunks, cache.samples
        );
    }
    if !report.stop.is_clean() {
        let line = format!(
            "  detached: {:?}, panicked: {:?}",
            report.stop.detached, report.stop.panicked
        );
        if color {
            println!("{}", line.red());
        } else {
            println!("{}", line);
        }
    }
    if let Some(path) = &output.report_path {
        println!("  report:   {}", path.display());
    }
}

fn handle_config_command(action: &ConfigAction, cli: &Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = load_config(cli)?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
        ConfigAction::Init { force } => {
            write_default_config(&config_path, *force)?;
            println!("Wrote {}", config_path.display());
        }
    }
    Ok(())
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, Config::default().to_toml()?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
