use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use token_butler::butler::{Butler, ButlerOptions, wait_until_settled};
use token_butler::config::{Config, parse_tx_hash};
use token_butler::connector::{EvmConnector, EvmWallet};
use token_butler::formatters::{OutputFormat, format_tokens, format_transactions};
use token_butler::rpc::RpcClient;
use token_butler::store::StateStore;
use token_butler::wallet::{WalletProvider, WalletSnapshot};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "butler")]
#[command(about = "Keep wallet token balances reconciled with the chain", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile continuously until interrupted.
    Run {
        /// Transaction hash to follow; may be repeated.
        #[arg(long = "watch-tx")]
        watch_tx: Vec<String>,

        /// Invalidate every token on this period.
        #[arg(long)]
        poll_secs: Option<u64>,

        /// Print the token table on this period.
        #[arg(long)]
        snapshot_secs: Option<u64>,
    },
    /// Reconcile once and print the result.
    Snapshot {
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },
}

async fn initial_wallet(config: &Config, wallet: &EvmWallet) -> Result<WalletSnapshot> {
    if let Some(key) = &config.wallet_private_key {
        return wallet.reconnect(key, &config.network).await;
    }
    if let Some(address) = config.wallet_address {
        return wallet.watch(address, &config.network).await;
    }
    bail!("either WALLET_PRIVATE_KEY or WALLET_ADDRESS must be set in .env")
}

fn print_state(store: &StateStore, format: &OutputFormat) {
    let state = store.state();
    println!("{}", format_tokens(&state, format));
    if !state.transactions.is_empty() {
        println!("{}", format_transactions(&state.transactions, format));
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let config = Config::from_env()?;
    info!(
        endpoints = config.json_rpc_urls.len(),
        tokens = config.token_addresses.len(),
        network = %config.network,
        "configuration loaded"
    );

    let client = RpcClient::new(&config.json_rpc_urls)?;
    let connector = Arc::new(EvmConnector::new(client.clone(), config.connector_config()));
    let wallet = Arc::new(EvmWallet::new(client));
    let snapshot = initial_wallet(&config, &wallet).await?;

    let store = StateStore::new();

    match cli.command {
        Commands::Run {
            watch_tx,
            poll_secs,
            snapshot_secs,
        } => {
            let hashes = watch_tx
                .iter()
                .map(|raw| parse_tx_hash(raw))
                .collect::<Result<Vec<_>>>()?;

            let options = ButlerOptions {
                native: config.native.clone(),
                event_queue_capacity: config.tx_event_queue_capacity,
                poll_interval: poll_secs.map(|secs| Duration::from_secs(secs.max(1))),
                ..ButlerOptions::default()
            };
            let mut butler = Butler::new(store.clone(), Arc::clone(&connector), wallet, options);
            butler.connect_wallet(snapshot);
            butler.subscribe_transactions();
            for hash in hashes {
                butler.track_transaction(hash);
                connector.watch_transaction(hash);
            }

            if let Some(secs) = snapshot_secs {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut ticker = interval(Duration::from_secs(secs.max(1)));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        print_state(&store, &format);
                    }
                });
            }

            butler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "failed to listen for ctrl-c");
                        std::future::pending::<()>().await;
                    }
                    info!("shutdown requested");
                })
                .await;
            print_state(&store, &format);
        }
        Commands::Snapshot { timeout_secs } => {
            let options = ButlerOptions {
                native: config.native.clone(),
                event_queue_capacity: config.tx_event_queue_capacity,
                ..ButlerOptions::default()
            };
            let mut butler = Butler::new(store.clone(), connector, wallet, options);
            butler.connect_wallet(snapshot);

            let settled = store.clone();
            butler
                .run(async move {
                    let limit = Duration::from_secs(timeout_secs);
                    if timeout(limit, wait_until_settled(&settled)).await.is_err() {
                        warn!(timeout_secs, "tokens did not settle before the timeout");
                    }
                })
                .await;
            print_state(&store, &format);
        }
    }

    Ok(())
}
