//! Operator CLI for the fleet controller.
//!
//! Provides:
//! - `demo`: drive the full stack (session manager + risk engine) against the
//!   simulated venue, with live event output and a status table
//! - `generate-config`: write a default configuration file
//!
//! The real browser-automation connector is a separate deployment concern;
//! this binary wires the core against [`fleet_broker::sim::SimBroker`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::{settings::Style, Table, Tabled};
use tracing_subscriber::EnvFilter;

use fleet_broker::{sim::SimBroker, Credentials};
use fleet_core::{EventBus, FleetConfig, OrderType, Position};
use fleet_risk::RiskEngine;
use fleet_sessions::SessionManager;

mod dispatcher;

use dispatcher::{Command, CommandResponse, Dispatcher};

/// Multi-account trading fleet controller
#[derive(Parser, Debug)]
#[clap(name = "fleet", version, about, long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Sets log level when RUST_LOG is unset
    #[clap(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stack against the simulated venue
    Demo {
        /// Number of simulated accounts to connect
        #[clap(short, long, default_value_t = 3)]
        accounts: usize,

        /// Seconds to run before flattening and shutting down
        #[clap(short, long, default_value_t = 15)]
        duration: u64,
    },

    /// Generate a default configuration file
    GenerateConfig {
        /// Output file
        #[clap(short, long, value_name = "FILE", default_value = "config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::GenerateConfig { output } => {
            FleetConfig::default().write_to_file(&output)?;
            println!(
                "{} wrote default configuration to {}",
                style("ok").green(),
                output.display()
            );
            Ok(())
        }
        Commands::Demo { accounts, duration } => {
            let config = load_config(&cli.config);
            run_demo(config, accounts, duration).await
        }
    }
}

fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &PathBuf) -> FleetConfig {
    if path.exists() {
        match FleetConfig::from_file(path) {
            Ok(config) => return config,
            Err(err) => {
                eprintln!(
                    "{} failed to load {}: {err:#}, using defaults",
                    style("warning").yellow(),
                    path.display()
                );
            }
        }
    }
    FleetConfig::default()
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Account")]
    account_id: String,
    #[tabled(rename = "Name")]
    account_name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Equity")]
    equity: String,
    #[tabled(rename = "Open P&L")]
    pnl: String,
    #[tabled(rename = "Positions")]
    positions: usize,
}

async fn run_demo(config: FleetConfig, accounts: usize, duration: u64) -> Result<()> {
    let broker = Arc::new(SimBroker::new());
    let sessions = Arc::new(SessionManager::new(config.clone(), broker.clone()));
    let events = EventBus::default();
    let risk = Arc::new(RiskEngine::new(&config, sessions.clone(), events.clone()));
    let dispatcher = Dispatcher::new(sessions.clone(), risk.clone());

    // Stream risk-engine events as they happen.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            println!("{} {event:?}", style("event").cyan().bold());
        }
    });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message(format!("connecting {accounts} simulated accounts"));

    let entry_price = 15_000.0;
    for i in 1..=accounts {
        let account_id = format!("sim-{i}");
        let account = broker.account(&account_id);
        account.set_account(&format!("Demo {i}"), 50_000.0, 0.0);
        account.set_last_price("NQ", entry_price);

        dispatcher
            .dispatch(Command::Connect {
                account_id: account_id.clone(),
                credentials: Credentials {
                    username: format!("trader{i}"),
                    password: "demo".to_string(),
                },
            })
            .await
            .with_context(|| format!("failed to connect {account_id}"))?;
    }
    spinner.finish_with_message(format!("{accounts} accounts connected"));

    dispatcher.dispatch(Command::StartMonitoring).await?;
    dispatcher
        .dispatch(Command::BuyAll {
            symbol: "NQ".to_string(),
            quantity: 1,
            order_type: OrderType::Market,
        })
        .await?;

    // Walk the market upward so break-even promotion and trailing have
    // something to chew on.
    let mut price = entry_price;
    for _ in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;
        price += 2.5;
        let pnl = (price - entry_price) * 5.0;
        for i in 1..=accounts {
            let account = broker.account(&format!("sim-{i}"));
            account.set_last_price("NQ", price);
            account.set_positions(vec![Position {
                symbol: "NQ".to_string(),
                quantity: 1.0,
                avg_price: entry_price,
                unrealized_pnl: pnl,
            }]);
        }
    }

    print_status(&dispatcher).await?;

    dispatcher.dispatch(Command::CloseAll).await?;
    dispatcher.dispatch(Command::StopMonitoring).await?;
    sessions.shutdown().await;

    println!("{} demo finished", style("ok").green().bold());
    Ok(())
}

async fn print_status(dispatcher: &Dispatcher) -> Result<()> {
    if let CommandResponse::AccountsStatus { accounts } =
        dispatcher.dispatch(Command::AccountsStatus).await?
    {
        let rows: Vec<StatusRow> = accounts
            .iter()
            .map(|record| StatusRow {
                account_id: record.account_id.clone(),
                account_name: record.account_name.clone(),
                status: format!("{:?}", record.status),
                equity: format!("{:.2}", record.equity),
                pnl: format!("{:.2}", record.pnl),
                positions: record.positions.len(),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    if let CommandResponse::RiskStatistics { statistics } =
        dispatcher.dispatch(Command::RiskStatistics).await?
    {
        println!(
            "{} tracked={} stops={} targets={} break-even={} monitoring={}",
            style("risk").magenta().bold(),
            statistics.tracked_orders,
            statistics.stop_loss_set,
            statistics.take_profit_set,
            statistics.break_even_moved,
            statistics.monitoring,
        );
    }
    Ok(())
}
