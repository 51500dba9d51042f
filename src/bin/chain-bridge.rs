//! chain-bridge CLI
//!
//! Parses dumped chain tables, inspects the position store, and drives
//! collections and the sync bridge against a running Chrome.

use anyhow::{Context, bail};
use async_trait::async_trait;
use chain_bridge::browser::{BrowserSession, ChromeChain, ChromeHost, ConnectionOptions, LaunchOptions, TabLocalStorage};
use chain_bridge::collect::{ChainSource, CollectionOutcome, CollectionProgress, Collector};
use chain_bridge::config::BridgeConfig;
use chain_bridge::dom::DomTree;
use chain_bridge::router::{Background, TabCommands, TabId, protocol_schema};
use chain_bridge::scrape::parse_chain;
use chain_bridge::store::{FileStore, PositionStore};
use chain_bridge::sync::{StopReason, SyncBridge, SyncScheduler};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chain-bridge")]
#[command(version)]
#[command(about = "Option-chain scraper and calculator sync bridge", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short = 'c', value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Durable store file (overrides the configuration)
    #[arg(long, value_name = "PATH", global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct BrowserArgs {
    /// WebSocket endpoint of a running Chrome
    #[arg(long, value_name = "URL")]
    ws: Option<String>,

    /// Launch browser in headed mode (when not attaching)
    #[arg(long, short = 'H')]
    headed: bool,

    /// Persistent browser profile directory
    #[arg(long, value_name = "DIR")]
    user_data_dir: Option<PathBuf>,
}

impl BrowserArgs {
    fn session(&self) -> anyhow::Result<BrowserSession> {
        let session = match &self.ws {
            Some(ws) => BrowserSession::connect(ConnectionOptions::new(ws.clone()))?,
            None => {
                let mut options = LaunchOptions::new().headless(!self.headed);
                if let Some(dir) = &self.user_data_dir {
                    options = options.user_data_dir(dir.clone());
                }
                BrowserSession::launch(options)?
            }
        };
        Ok(session)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a dumped chain DOM (`{url, expiration, underlying, root}`) and print the options
    Parse {
        #[arg(value_name = "DOM_JSON")]
        path: PathBuf,
    },

    /// Inspect or edit the stored positions
    Positions {
        #[command(subcommand)]
        action: PositionsAction,
    },

    /// Collect every expiration of the chain shown in the browser
    Collect {
        #[command(flatten)]
        browser: BrowserArgs,

        /// Open this ticker's chain page first, e.g. ESH2026
        #[arg(long)]
        ticker: Option<String>,

        /// Expirations to visit besides the current one
        #[arg(long)]
        max_expirations: Option<usize>,
    },

    /// Keep an open calculator tab in sync until it closes
    Sync {
        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Print the JSON schema of the command protocol
    Schema,
}

#[derive(Subcommand)]
enum PositionsAction {
    /// List positions, optionally for one ticker
    List {
        #[arg(long)]
        ticker: Option<String>,
    },
    /// Remove one position
    Remove {
        #[arg(long)]
        ticker: String,
        #[arg(long)]
        id: String,
    },
    /// Clear one ticker, or everything
    Clear {
        #[arg(long)]
        ticker: Option<String>,
    },
}

/// Prints progress lines to stderr
struct StderrProgress;

#[async_trait]
impl CollectionProgress for StderrProgress {
    async fn progress(&self, percent: u8, collected: usize, text: &str) {
        eprintln!("[{:>3}%] {} ({} options)", percent, text, collected);
    }

    async fn complete(&self, outcome: &CollectionOutcome) {
        match &outcome.error {
            Some(error) => eprintln!("Finished {:?}: {}", outcome.status, error),
            None => eprintln!("Finished {:?}", outcome.status),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(store) = cli.store {
        config.storage_path = store;
    }

    match cli.command {
        Commands::Parse { path } => parse(&path),
        Commands::Positions { action } => positions(&config, action).await,
        Commands::Collect {
            browser,
            ticker,
            max_expirations,
        } => collect(config, &browser, ticker, max_expirations).await,
        Commands::Sync { browser } => sync(config, &browser).await,
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&protocol_schema())?);
            Ok(())
        }
    }
}

fn parse(path: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tree = DomTree::from_json(&json)?;
    let page = parse_chain(&tree)?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

async fn positions(config: &BridgeConfig, action: PositionsAction) -> anyhow::Result<()> {
    let mut store = PositionStore::new(Arc::new(FileStore::new(&config.storage_path)));
    store.load().await?;

    match action {
        PositionsAction::List { ticker: Some(ticker) } => {
            println!("{}", serde_json::to_string_pretty(store.get(&ticker))?);
        }
        PositionsAction::List { ticker: None } => {
            println!("{}", serde_json::to_string_pretty(store.all())?);
        }
        PositionsAction::Remove { ticker, id } => {
            if !store.remove(&ticker, &id).await {
                bail!("no position {} under {}", id, ticker);
            }
            store.save().await?;
        }
        PositionsAction::Clear { ticker } => {
            store.clear(ticker.as_deref()).await;
            store.save().await?;
        }
    }
    Ok(())
}

async fn collect(
    config: BridgeConfig,
    browser: &BrowserArgs,
    ticker: Option<String>,
    max_expirations: Option<usize>,
) -> anyhow::Result<()> {
    let session = browser.session()?;
    let tab = match ticker {
        Some(ticker) => {
            let tab = session.new_tab()?;
            BrowserSession::navigate(&tab, &config.source.chain_url(&ticker))?;
            tab
        }
        None => session.find_chain_tab()?,
    };

    let mut collection = config.collection.clone();
    if let Some(max) = max_expirations {
        collection.max_expirations = max;
    }

    let source = Arc::new(ChromeChain::new(&tab));
    source.wait_until_ready(collection.page_timeout_duration()).await?;

    let durable = Arc::new(FileStore::new(&config.storage_path));
    let outcome = Collector::new(source, durable, collection).run(&StderrProgress).await;
    if !outcome.is_success() {
        bail!(outcome.error.unwrap_or_else(|| "collection failed".to_string()));
    }
    println!(
        "{}",
        serde_json::json!({
            "optionsCount": outcome.collected_count,
            "expirations": outcome.expirations_collected,
            "error": outcome.error,
        })
    );
    Ok(())
}

async fn sync(config: BridgeConfig, browser: &BrowserArgs) -> anyhow::Result<()> {
    let session = Arc::new(browser.session()?);
    let destination = &config.destination;
    let tab = session
        .get_tabs()?
        .into_iter()
        .find(|tab| destination.matches(&tab.get_url()))
        .context("no calculator tab open")?;
    let tab_id = TabId::from(tab.get_target_id().as_str());

    let durable = Arc::new(FileStore::new(&config.storage_path));
    let background = Background::new(config.clone(), Arc::new(ChromeHost::new(session.clone())), durable.clone());
    let bridge = SyncBridge::new(Arc::new(TabLocalStorage::new(&tab)), durable)
        .with_default_ticker(config.default_ticker.clone())
        .with_commands(Arc::new(TabCommands::new(background, tab_id.clone())));

    log::info!("Syncing calculator tab {}", tab_id);
    drop(tab);

    let outcome = SyncScheduler::new(config.poll_interval_duration()).run(bridge).await;
    match outcome.reason {
        StopReason::ChannelClosed => log::info!("Calculator tab closed after {} passes", outcome.ticks),
        StopReason::Stopped => log::info!("Stopped after {} passes", outcome.ticks),
    }
    Ok(())
}
