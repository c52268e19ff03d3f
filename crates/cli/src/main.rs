//! Cart sync CLI - inspect and drive the cart sync engine from a terminal.
//!
//! Each invocation is one "tab" on the durable storage directory. One-shot
//! commands leave unsynced changes pending; the next `watch` session or
//! `resync` sends them.
//!
//! # Usage
//!
//! ```bash
//! # Show the durable cart
//! cart-sync show
//!
//! # Add two of a product, then remove it
//! cart-sync add SKU-123 --qty 2
//! cart-sync remove SKU-123
//!
//! # Log in, merging the guest cart into the server cart
//! cart-sync login --user-id u-42 --token "$JWT"
//!
//! # Push the whole cart to the server
//! cart-sync resync
//!
//! # Run a long-lived session driven by stdin
//! cart-sync watch
//! ```
//!
//! # Commands
//!
//! - `show`, `add`, `remove`, `clear` - Local cart
//! - `login`, `logout` - Identity transitions
//! - `resync` - Explicit full sync
//! - `watch` - Interactive session; Ctrl+C flushes pending changes and exits

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sentry::integrations::tracing as sentry_tracing;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cart_sync_client::CartSyncConfig;
use cart_sync_client::config::ConfigError;

mod commands;

/// Storage directory used with `--api-url` when `--storage-dir` is not given.
const DEFAULT_STORAGE_DIR: &str = ".cart-sync";

#[derive(Parser)]
#[command(name = "cart-sync")]
#[command(author, version, about = "Cart sync engine CLI")]
struct Cli {
    /// Cart API base URL; other settings take their defaults
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory backing durable storage
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cart and pending changes
    Show,
    /// Change a product's quantity
    Add {
        /// Product ID
        product: String,

        /// Quantity to add (negative to subtract)
        #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
        qty: i64,
    },
    /// Remove a product
    Remove {
        /// Product ID
        product: String,
    },
    /// Empty the cart
    Clear,
    /// Log in and merge the guest cart
    Login {
        /// User ID
        #[arg(long)]
        user_id: String,

        /// Bearer token (JWT)
        #[arg(long)]
        token: String,

        /// Role (`USER`, `ADMIN`)
        #[arg(long, default_value = "USER")]
        role: String,
    },
    /// Log out and reset to an empty guest cart
    Logout,
    /// Send the whole cart to the server now
    Resync,
    /// Run an interactive session
    Watch,
}

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &CartSyncConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

fn load_config(cli: &Cli) -> Result<CartSyncConfig, ConfigError> {
    let mut config = match cli.api_url.as_deref() {
        Some(url) => {
            let mut config = CartSyncConfig::default_for(url)?;
            config.storage_dir = Some(PathBuf::from(DEFAULT_STORAGE_DIR));
            config
        }
        None => CartSyncConfig::from_env()?,
    };
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(&cli);

    // Initialize Sentry (must be done before tracing subscriber)
    let sentry_guard = config.as_ref().ok().and_then(init_sentry);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cart_sync_client=info,cart_sync_cli=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let result = match config {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        drop(sentry_guard);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: CartSyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = commands::open(config)?;

    match command {
        Commands::Show => commands::cart::show(&client),
        Commands::Add { product, qty } => commands::cart::add(&client, &product, qty)?,
        Commands::Remove { product } => commands::cart::remove(&client, &product)?,
        Commands::Clear => commands::cart::clear(&client),
        Commands::Login {
            user_id,
            token,
            role,
        } => commands::session::login(&client, &user_id, token, &role).await?,
        Commands::Logout => commands::session::logout(&client),
        Commands::Resync => commands::session::resync(&client).await?,
        Commands::Watch => commands::watch::run(&client).await?,
    }

    client.shutdown();
    Ok(())
}
