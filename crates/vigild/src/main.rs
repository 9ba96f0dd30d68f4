//! vigild - Vigil alert evaluation daemon

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vigil_alerts::config::format_duration;
use vigil_alerts::load_rules_file;
use vigild::{DaemonConfig, Engine, build_manager, load_rules};

const DEFAULT_FILTER: &str = "vigild=info,vigil_alerts=info,vigil_metrics=info";

#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "Vigil alert evaluation daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "VIGIL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/vigil/vigild.json", env = "VIGIL_CONFIG")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/vigil/vigild.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a rule file and print per-rule diagnostics
    CheckRules {
        /// Path to the rule file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run { config } => run_daemon(&config).await?,
        Commands::InitConfig { output, force } => init_config(&output, force)?,
        Commands::CheckRules { file } => check_rules(&file)?,
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run_daemon(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting vigild");

    let config = DaemonConfig::from_file(config_path)?;
    info!(
        source = ?config.source,
        rules = %config.rules_path.display(),
        "loaded config"
    );

    let manager = build_manager(&config)?;
    let rules = load_rules(&config.rules_path)?;

    let engine = Engine::spawn(manager, &config, rules);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(path = %config.rules_path.display(), "SIGHUP received, reloading rules");
                match load_rules(&config.rules_path) {
                    Ok(rules) => {
                        if !engine.reload(rules).await {
                            warn!("scheduler stopped, reload dropped");
                        }
                    }
                    Err(e) => error!(error = %e, "rule reload failed, keeping current rules"),
                }
            }
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    engine.stop().await?;

    info!("vigild stopped");
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            output.display()
        );
    }

    let config = DaemonConfig::sample();
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!(
        "Edit the source URL and channels, write rules to {}, then run:",
        config.rules_path.display()
    );
    println!("  vigild run --config {}", output.display());

    Ok(())
}

fn check_rules(file: &Path) -> anyhow::Result<()> {
    let set = load_rules_file(file)?;

    for rule in &set.rules {
        println!(
            "ok     {} ({} {} every {}, for {})",
            rule.name,
            rule.operator,
            rule.threshold,
            format_duration(rule.interval),
            format_duration(rule.for_duration)
        );
    }
    for err in &set.errors {
        println!("error  {err}");
    }

    println!();
    println!(
        "{} rule(s) valid, {} rejected",
        set.rules.len(),
        set.errors.len()
    );

    if !set.is_clean() {
        anyhow::bail!("{} rule(s) rejected in {}", set.errors.len(), file.display());
    }
    Ok(())
}
