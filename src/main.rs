// src/main.rs
//! Bridge watcher entry point.
//! Tracks bridge transactions for one account and keeps their status current.
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rollup_bridge::blockchain::bridge::{
    BridgeAssetType, BridgeTxnType, SessionInputs, StoreEvent, TxDraft, TxFilter,
    UnsupportedMessageSource,
};
use rollup_bridge::blockchain::ethereum::{EthereumProvider, EthereumProviderFactory};
use rollup_bridge::core::config::EngineConfig;
use rollup_bridge::service::{BridgeEngine, EngineDeps};
use rollup_bridge::storage::BridgeStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "bridge_watcher")]
#[command(about = "L1 <-> L2 bridge transaction watcher")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the TOML configuration (defaults to $CONFIG_PATH or bridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a wallet RPC endpoint and keep tracked transactions up to date
    Watch {
        /// Chain the wallet is on; its first configured RPC URL is used
        #[arg(long)]
        chain_id: u64,
        /// Account whose transactions are tracked
        #[arg(long)]
        account: String,
        /// Overrides the registry RPC URL for the active chain
        #[arg(long)]
        rpc_url: Option<String>,
    },
    /// Record a new bridge transaction
    Submit(SubmitArgs),
    /// Print stored records with their derived status as JSON
    List {
        #[arg(long)]
        chain_id: Option<u64>,
        #[arg(long)]
        account: Option<String>,
        /// Group an account's legs into transfers instead
        #[arg(long, requires = "account")]
        transfers: bool,
    },
    /// Print what a signer needs to execute a confirmed withdrawal
    Outbox {
        #[arg(long)]
        chain_id: u64,
        #[arg(long)]
        tx_hash: String,
    },
    /// Forget every transaction sent by an account
    Clear {
        #[arg(long)]
        account: String,
    },
}

#[derive(ClapArgs)]
struct SubmitArgs {
    /// Leg type, e.g. deposit-l1, withdraw, outbox
    #[arg(long = "type")]
    tx_type: BridgeTxnType,
    #[arg(long)]
    chain_id: u64,
    #[arg(long)]
    tx_hash: String,
    #[arg(long)]
    sender: String,
    #[arg(long, default_value = "ETH")]
    asset_name: String,
    #[arg(long, default_value = "NATIVE")]
    asset_type: BridgeAssetType,
    #[arg(long, default_value = "0")]
    value: String,
    #[arg(long)]
    partner_tx_hash: Option<String>,
    #[arg(long)]
    seq_num: Option<u64>,
}

impl SubmitArgs {
    fn into_draft(self) -> TxDraft {
        let mut draft = TxDraft::new(self.tx_type, self.chain_id, &self.tx_hash, &self.sender).asset(
            &self.asset_name,
            self.asset_type,
            &self.value,
        );
        if let Some(partner) = &self.partner_tx_hash {
            draft = draft.partner(partner);
        }
        if let Some(seq) = self.seq_num {
            draft = draft.seq_num(seq);
        }
        draft
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;

    info!("Starting bridge watcher v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("bridge.toml"));
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let storage = Arc::new(BridgeStorage::new_with_url(&config.storage.database_url).await?);
    let engine = BridgeEngine::new(
        &config,
        EngineDeps {
            provider_factory: Arc::new(EthereumProviderFactory::new(config.provider.clone())),
            message_source: Arc::new(UnsupportedMessageSource),
            reward_claimer: None,
            storage: Some(storage),
        },
    );

    match args.command {
        Commands::Watch { chain_id, account, rpc_url } => {
            let rpc_url = match rpc_url {
                Some(url) => url,
                None => engine
                    .registry()
                    .rpc_url(chain_id, config.provider.infura_project_id.as_deref())
                    .with_context(|| format!("no RPC endpoint known for chain {}", chain_id))?,
            };
            watch(&engine, &config, chain_id, &rpc_url, &account).await?
        }
        Commands::Submit(submit) => {
            engine.load().await?;
            match engine.submit(submit.into_draft()).await {
                Ok(outcome) => println!("{:?}", outcome),
                Err(e) if e.is_user_facing() => anyhow::bail!("submission rejected: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List { chain_id, account, transfers } => {
            engine.load().await?;
            match (transfers, account) {
                (true, Some(account)) => {
                    let summaries = engine.read().transfer_summaries(&account);
                    println!("{}", serde_json::to_string_pretty(&summaries)?);
                }
                (_, account) => {
                    let account = account.map(|a| a.to_ascii_lowercase());
                    let filter = TxFilter { chain_id, account, include_dismissed: true };
                    let rows: Vec<_> = engine
                        .read()
                        .list(&filter)
                        .into_iter()
                        .map(|tx| {
                            serde_json::json!({
                                "status": tx.status(),
                                "withdrawalPhase": tx.withdrawal_phase(),
                                "record": tx,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Outbox { chain_id, tx_hash } => {
            engine.load().await?;
            match engine.commands().prepare_outbox_execution(chain_id, &tx_hash) {
                Ok(execution) => println!("{}", serde_json::to_string_pretty(&execution)?),
                Err(e) if e.is_user_facing() => anyhow::bail!("cannot execute yet: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Clear { account } => {
            engine.load().await?;
            let removed = engine.clear_history(&account).await?;
            println!("Removed {} transactions", removed.len());
        }
    }

    Ok(())
}

async fn watch(
    engine: &BridgeEngine,
    config: &EngineConfig,
    chain_id: u64,
    rpc_url: &str,
    account: &str,
) -> Result<()> {
    let loaded = engine.start().await?;
    info!(loaded, chain_id, "Watching bridge transactions");

    let wallet = EthereumProvider::connect(rpc_url, Some(chain_id), &config.provider).await?;
    engine.on_wallet_changed(SessionInputs::new(chain_id, account, Arc::new(wallet)));

    let subscription = engine.read().subscribe(TxFilter::account(account), |event: &StoreEvent| {
        if let StoreEvent::Upserted(records) = event {
            for tx in records {
                info!(key = %tx.key(), status = ?tx.status(), "Transaction updated");
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Shutting down");
    engine.read().unsubscribe(subscription);
    engine.shutdown().await;
    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=info,h2=info,sqlx=warn"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
