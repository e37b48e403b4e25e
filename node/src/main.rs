use anyhow::{Context, Result, anyhow, bail};
use cancelchain_config::{Config, PeerConfig};
use cancelchain_core::export::{export_to_file, import_chain, validate_chain};
use cancelchain_core::{Blockchain, ConsensusParams, Wallet};
use cancelchain_node::p2p::sync::run_sync_loop;
use cancelchain_node::p2p::client::HttpPeer;
use cancelchain_node::send::{Intent, send};
use cancelchain_node::server::auth::{Role, RoleTable};
use cancelchain_node::{NodeHandles, PeerManager, miner, run_server};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "cancelchain", version, about = "Permissioned proof-of-work sentiment ledger")]
struct Cli {
    /// Configuration file (defaults to ~/.cancelchain/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: HTTP API, peer sync and, if enabled, the miner
    Run,
    /// Append the canonical chain to an NDJSON file
    Export { file: PathBuf },
    /// Feed blocks from an NDJSON file through the validator
    Import { file: PathBuf },
    /// Replay the stored canonical chain through the validator
    Validate,
    /// Send plain weight to another address
    Transfer {
        to: String,
        amount: u64,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Oppose a subject
    Oppose {
        subject: String,
        amount: u64,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Rescind earlier opposition of a subject
    Forgive {
        subject: String,
        amount: u64,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Permanently support a subject
    Support {
        subject: String,
        amount: u64,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Create the wallet file named in the configuration
    InitWallet {
        /// Overwrite an existing wallet
        #[arg(long)]
        force: bool,
    },
    /// Inspect or change the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Node that receives wallet transactions.
#[derive(Args)]
struct NodeArgs {
    /// Node API URL (defaults to the local listen address)
    #[arg(long)]
    node: Option<String>,
    /// Bearer token (defaults to a transactor token from the configuration)
    #[arg(long)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    View,
    Set { key: String, value: String },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_path)
}

fn open_chain(cfg: &Config) -> Result<Blockchain> {
    let params = ConsensusParams::for_network(&cfg.network)
        .ok_or_else(|| anyhow!("unknown network {:?}", cfg.network))?;
    let data_dir = cfg.data_dir_resolved();
    Blockchain::open_rocks(&data_dir, params)
        .with_context(|| format!("failed to open chain database at {}", data_dir.display()))
}

fn node_peer(cfg: &Config, args: NodeArgs) -> Result<HttpPeer> {
    let url = args.node.unwrap_or_else(|| {
        format!("http://{}", cfg.listen_addr.replace("0.0.0.0", "127.0.0.1"))
    });
    let token = args.token.or_else(|| {
        cfg.api_tokens
            .iter()
            .find(|(_, role)| role.parse::<Role>().is_ok_and(|r| r >= Role::Transactor))
            .map(|(token, _)| token.clone())
    });
    HttpPeer::new(
        &PeerConfig { url, token },
        Duration::from_secs(cfg.peer_timeout_secs),
    )
}

async fn send_intent(cfg: &Config, args: NodeArgs, intent: Intent, amount: u64) -> Result<()> {
    let wallet_path = cfg.wallet_path_resolved();
    let wallet = Wallet::load(&wallet_path)
        .with_context(|| format!("no wallet at {}", wallet_path.display()))?;
    let peer = node_peer(cfg, args)?;
    let tx = send(&peer, &wallet, &intent, amount).await?;
    println!("{}", tx.txid);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let path = config_path(&cli);
    let mut cfg = Config::load_from(&path)?;

    match cli.command {
        Command::Run => run(cfg).await,
        Command::Export { file } => {
            let chain = open_chain(&cfg)?;
            let written = export_to_file(&chain, &file)?;
            info!("📦 Exported {} block(s) to {}", written, file.display());
            Ok(())
        }
        Command::Import { file } => {
            let mut chain = open_chain(&cfg)?;
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("cannot open {}", file.display()))?,
            );
            let summary = import_chain(&mut chain, reader)?;
            info!(
                "📦 Imported {} block(s), skipped {} already known; head is now {} at height {}",
                summary.accepted,
                summary.skipped,
                chain.head().hash,
                chain.head().height
            );
            Ok(())
        }
        Command::Validate => {
            let chain = open_chain(&cfg)?;
            let height = validate_chain(&chain)?;
            info!("✅ Chain valid up to height {} ({})", height, chain.head().hash);
            Ok(())
        }
        Command::Transfer { to, amount, node } => {
            send_intent(&cfg, node, Intent::Transfer { to }, amount).await
        }
        Command::Oppose { subject, amount, node } => {
            send_intent(&cfg, node, Intent::Oppose { subject }, amount).await
        }
        Command::Forgive { subject, amount, node } => {
            send_intent(&cfg, node, Intent::Forgive { subject }, amount).await
        }
        Command::Support { subject, amount, node } => {
            send_intent(&cfg, node, Intent::Support { subject }, amount).await
        }
        Command::InitWallet { force } => {
            let wallet_path = cfg.wallet_path_resolved();
            if wallet_path.exists() && !force {
                bail!(
                    "wallet {} already exists (use --force to replace it)",
                    wallet_path.display()
                );
            }
            let wallet = Wallet::generate();
            wallet.save(&wallet_path)?;
            println!("{}", wallet.address());
            Ok(())
        }
        Command::Config { action } => {
            match action {
                ConfigAction::View => println!("{}", cfg.view()?),
                ConfigAction::Set { key, value } => {
                    cfg.set_value(&key, &value)?;
                    cfg.save_to(&path)?;
                    println!("✅ {} updated", key);
                }
            }
            Ok(())
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    info!("🚀 Cancelchain node starting on {} ({})", cfg.listen_addr, cfg.network);

    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {:?}", cfg.listen_addr))?;
    let chain = open_chain(&cfg)?;
    info!(
        "📊 Local head {} at height {}",
        chain.head().hash,
        chain.head().height
    );

    let roles = RoleTable::from_config(&cfg.api_tokens)?;
    let peers = PeerManager::from_config(&cfg.peers, Duration::from_secs(cfg.peer_timeout_secs))?;
    let node = NodeHandles::new(chain, peers, roles, cfg.mine);

    tokio::spawn(run_sync_loop(
        node.clone(),
        Duration::from_secs(cfg.sync_interval_secs.max(1)),
    ));

    // The miner runs whenever the config asks for it; the admin API can
    // pause it later without restarting.
    if cfg.mine {
        let wallet_path = cfg.wallet_path_resolved();
        let wallet = Wallet::load(&wallet_path)
            .with_context(|| format!("mining needs a wallet at {}", wallet_path.display()))?;
        tokio::spawn(miner::run_miner(node.clone(), wallet.address().to_string()));
    }

    tokio::select! {
        _ = run_server(node.clone(), addr) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutting down");
            node.mining.cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        _ = node.shutdown.notified() => {
            error!("💥 Storage failure, node stopped");
            Err(anyhow!("storage failure"))
        }
    }
}
