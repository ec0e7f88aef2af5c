//! # Herald — Scheduled Broadcast Worker
//!
//! Polls the broadcast store for due items and delivers them to Telegram
//! group chats, exactly once per (item, chat, occurrence).
//!
//! Usage:
//!   herald                         # Run the poll loop
//!   herald --once                  # Run a single tick and exit
//!   herald --config herald.toml    # Explicit config file

use anyhow::Result;
use clap::Parser;
use herald_core::HeraldConfig;
use herald_scheduler::{run_poller, Poller};
use herald_store::BroadcastDb;
use herald_telegram::{SendPipeline, TelegramApi};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "herald", version, about = "📣 Herald — scheduled broadcast worker")]
struct Cli {
    /// Config file path (default: ~/.herald/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Run a single poll tick and exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "herald=debug,herald_scheduler=debug,herald_telegram=debug,herald_store=debug"
    } else {
        "herald=info,herald_scheduler=info,herald_telegram=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => HeraldConfig::load_from(path)?,
        None => HeraldConfig::load()?,
    };
    if config.telegram.bot_token.is_empty() {
        anyhow::bail!("No bot token configured (set telegram.bot_token or HERALD_BOT_TOKEN)");
    }

    let db_path = cli.db_path.unwrap_or_else(|| config.store.db_path.clone());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = BroadcastDb::open(std::path::Path::new(&db_path))?;

    let api = TelegramApi::new(&config.telegram.bot_token, &config.telegram.api_base)?;
    let me = api.get_me().await?;
    tracing::info!(
        "🤖 Bot connected: @{} (id {})",
        me.username.as_deref().unwrap_or("unknown"),
        me.id
    );

    let pipeline = SendPipeline::new(
        api,
        Duration::from_millis(config.scheduler.min_delay_ms),
    );
    let poller = Poller::new(
        db,
        pipeline,
        config.scheduler.batch_size,
        &config.scheduler.tz,
    );

    println!("📣 Herald v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:      {db_path}");
    println!("   ⏱️  Poll interval: {}s", config.scheduler.poll_interval_secs);
    println!("   🌍 Default tz:    {}", config.scheduler.tz);
    println!();

    if cli.once {
        let examined = poller.tick().await?;
        tracing::info!("Single tick complete, {examined} item(s) examined");
        return Ok(());
    }

    run_poller(
        poller,
        Duration::from_secs(config.scheduler.poll_interval_secs),
    )
    .await;
    Ok(())
}
