use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use helmsman::config::EngineConfig;
use helmsman::controller::Controller;
use helmsman::ledger;
use helmsman::market::HttpMarketClient;
use helmsman::notifier::{HttpNotificationGateway, Notifier};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CONFIG_FILE: &str = "helmsman.json";

#[derive(Parser)]
#[command(name = "helmsman")]
#[command(about = "Adaptive portfolio controller for scored trading instruments")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run decision cycles continuously at the configured interval
    Run,
    /// Run exactly one decision cycle and exit
    Cycle {
        /// Plan and log intents without placing orders
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the persisted position ledger
    Positions,
    /// Validate the configuration file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    info!("Starting helmsman. Not financial advice. Use at your own risk.");

    match cli.command {
        Commands::Run => {
            let mut controller = build_controller(config)?;
            controller.run().await?;
        }
        Commands::Cycle { dry_run } => {
            let mut controller = build_controller(config)?;
            let report = controller.run_cycle(dry_run).await?;
            info!(
                "Cycle report: {} analyzed ({} failed), {} regime changes, {} intents, {} executed, {} order failures",
                report.analyzed,
                report.failed,
                report.regime_changes,
                report.intents_planned,
                report.executed,
                report.order_failures
            );
        }
        Commands::Positions => {
            let ledger = ledger::spawn(
                &config.ledger.snapshot_path,
                config.portfolio.max_entries_per_instrument,
            )?;
            let portfolio = ledger.portfolio().await?;
            if portfolio.positions.is_empty() {
                println!("No open positions.");
            }
            let mut instruments: Vec<&String> = portfolio.positions.keys().collect();
            instruments.sort();
            for instrument in instruments {
                let position = &portfolio.positions[instrument];
                println!(
                    "{}: size {:.8} @ avg {:.4} (entries {}, stop {:.4}, high {:.4}{})",
                    instrument,
                    position.size,
                    position.avg_entry_price,
                    position.entries.len(),
                    position.stop_loss,
                    position.highest_price,
                    if position.first_target_hit {
                        ", first target hit"
                    } else {
                        ""
                    }
                );
            }
        }
        Commands::CheckConfig => {
            println!(
                "Config OK: {} instruments, max {} positions, {} workers",
                config.instruments.len(),
                config.portfolio.max_positions,
                config.analysis.max_workers
            );
        }
    }

    Ok(())
}

fn build_controller(config: EngineConfig) -> Result<Controller<HttpMarketClient>> {
    let client = Arc::new(HttpMarketClient::new(&config.exchange)?);
    let notifier = match (&config.notifier.base_url, config.notifier.enabled) {
        (Some(base_url), true) => Notifier::new(Arc::new(HttpNotificationGateway::new(base_url)?)),
        _ => Notifier::disabled(),
    };
    let ledger = ledger::spawn(
        &config.ledger.snapshot_path,
        config.portfolio.max_entries_per_instrument,
    )?;
    Ok(Controller::new(config, client, ledger, notifier))
}
