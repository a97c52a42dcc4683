//! # Nudge — notification-driven job scheduler
//!
//! Runs recurring jobs on cron schedules, records every run, and delivers
//! the resulting messages through a rate-limited Telegram channel.
//!
//! Usage:
//!   nudge                        # Start the scheduler
//!   nudge --config nudge.toml    # Explicit config file
//!   nudge --seed-only            # Create missing default schedules, exit

mod collaborators;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use nudge_core::NudgeConfig;
use nudge_core::traits::{Membership, Messenger};
use nudge_channels::telegram::{TelegramChannel, TelegramConfig};
use nudge_scheduler::{
    Dispatcher, JobNotification, JobRegistry, NotificationSink, SchedulerDb, SchedulerEngine,
    SelectionLedger, daily_selection_reminder, spawn_scheduler,
};
use tracing_subscriber::EnvFilter;

use collaborators::{NoProductData, ProductDb};

#[derive(Parser)]
#[command(name = "nudge", version, about = "Notification-driven job scheduler")]
struct Cli {
    /// Config file path (default: ~/.nudge/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long)]
    data_dir: Option<String>,

    /// Seed missing default schedules and exit
    #[arg(long)]
    seed_only: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "nudge=debug" } else { "nudge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => NudgeConfig::load_from(path)?,
        None => NudgeConfig::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let db = Arc::new(SchedulerDb::open(
        &PathBuf::from(&config.data_dir).join("scheduler.db"),
    )?);

    // Collaborators: membership + selection data from the product database
    let (membership, ledger): (Arc<dyn Membership>, Arc<dyn SelectionLedger>) =
        if config.product_db.is_empty() {
            tracing::warn!("No product_db configured; packs resolve empty");
            let shared = Arc::new(NoProductData);
            (shared.clone(), shared)
        } else {
            let shared = Arc::new(ProductDb::open(PathBuf::from(&config.product_db).as_path())?);
            (shared.clone(), shared)
        };

    let mut registry = JobRegistry::new();
    registry.register(daily_selection_reminder(ledger));
    let registry = Arc::new(registry);

    // Delivery channel
    let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher));
    if config.telegram.enabled && !config.telegram.bot_token.is_empty() {
        let channel = Arc::new(TelegramChannel::new(TelegramConfig {
            bot_token: config.telegram.bot_token.clone(),
            enabled: true,
            request_timeout_secs: 10,
        }));
        if let Err(e) = channel.probe().await {
            tracing::warn!("Telegram probe failed, deliveries may not work: {e}");
        }
        dispatcher.initialize(channel);
    } else {
        tracing::warn!("No messaging channel configured; notifications will fail and be logged");
    }

    let sink: NotificationSink = {
        let dispatcher = dispatcher.clone();
        Arc::new(move |notifications: Vec<JobNotification>| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                let outcome = dispatcher.send_batch(&notifications).await;
                if outcome.failed > 0 {
                    tracing::warn!(
                        "{} of {} notification(s) failed delivery",
                        outcome.failed,
                        outcome.total
                    );
                }
            })
        })
    };

    let engine = Arc::new(SchedulerEngine::new(
        db.clone(),
        registry,
        membership,
        &config,
    ));
    engine.initialize(sink).await?;

    if cli.seed_only {
        for job in db.load_jobs()? {
            println!(
                "{}\t{}\t{}\t{}",
                job.job_key,
                job.schedule,
                job.timezone,
                if job.enabled { "enabled" } else { "disabled" }
            );
        }
        engine.shutdown().await;
        return Ok(());
    }

    let loop_handle = tokio::spawn(spawn_scheduler(engine.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");
    engine.shutdown().await;
    loop_handle.abort();
    Ok(())
}
