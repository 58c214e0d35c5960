use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use reward_ledger::balance::BalanceService;
use reward_ledger::configure::load_config;
use reward_ledger::logger::setup_logger;
use reward_ledger::reconciler::{OrderNotification, Reconciler};
use reward_ledger::settings::SettingsStore;
use reward_ledger::sweep::{SweepConfig, Sweeper};

#[derive(Parser, Debug)]
#[command(name = "reward_ledgerd", about = "Reward points ledger service")]
struct Args {
    /// Override the ledger data directory from config
    #[arg(long)]
    data_dir: Option<String>,

    /// Disable the background consistency sweep
    #[arg(long)]
    no_sweep: bool,
}

/// Reads order notifications as JSON lines on stdin and prints one outcome
/// per line. The real subscription adapter (queue consumer, webhook, ...)
/// lives outside this core and speaks the same notification contract.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config()?;
    setup_logger(&config)?;

    let data_dir = args.data_dir.unwrap_or_else(|| config.data_dir.clone());
    let settings = Arc::new(SettingsStore::open(Path::new(&config.settings_dir))?);
    let service = Arc::new(BalanceService::open(Path::new(&data_dir), settings)?);
    let reconciler = Reconciler::new(service.clone());

    let sweeper = if args.no_sweep {
        None
    } else {
        Some(Sweeper::spawn(
            service.clone(),
            None,
            None,
            SweepConfig {
                interval: Duration::from_secs(config.sweep_interval_secs),
                reservation_ttl: Duration::from_secs(config.reservation_ttl_secs),
            },
        ))
    };

    log::info!("reward_ledgerd ready, reading order notifications from stdin");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OrderNotification>(&line) {
            Ok(notification) => match reconciler.handle(&notification) {
                Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                Err(e) => {
                    log::error!("Reconcile failed: {}", e);
                    println!(
                        "{}",
                        serde_json::json!({
                            "error": e.error_code(),
                            "message": e.to_string(),
                            "retryable": e.is_retryable(),
                        })
                    );
                }
            },
            Err(e) => log::error!("Bad notification line: {}", e),
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.stop();
    }
    Ok(())
}
