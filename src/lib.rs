pub mod auth;
pub mod background;
pub mod classifier;
pub mod content;
pub mod db;
pub mod ingest;
pub mod page;
pub mod settings;
pub mod simplify;
pub mod telemetry;
pub mod tracking;
mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use background::BackgroundService;
use db::Database;
use ingest::{FlushOutcome, FlushPipeline, FlushScheduler};
use settings::SettingsStore;
use telemetry::TelemetryBuffer;

const DEBUG_ENV: &str = "KLARTEXT_DEBUG";

/// Text simplification and reading telemetry service.
#[derive(Parser)]
#[command(name = "klartext")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background service until Ctrl-C (default)
    Serve,

    /// Exchange a one-time key for the study API key
    Login {
        /// Six-digit study id
        #[arg(long)]
        user_id: String,

        /// One-time key handed out with the study id
        #[arg(long)]
        key: String,
    },

    /// Forget the stored study id and API key
    Logout,

    /// Show the extension switch, credentials and buffered counts
    Status,

    /// Upload buffered telemetry once
    Flush,

    /// Flip the extension on or off
    Toggle {
        /// Hostname of the page in front, if any
        #[arg(long)]
        hostname: Option<String>,
    },

    /// Stop simplifying on a site
    Block { hostname: String },

    /// Change persisted service settings
    Config {
        #[arg(long)]
        server_url: Option<String>,

        /// Simplification level sent with every request
        #[arg(long)]
        level: Option<u8>,

        #[arg(long)]
        auto_start: Option<bool>,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("klartext"))
        .unwrap_or_else(|| PathBuf::from(".klartext"))
}

fn init_logging() {
    let level = match std::env::var(DEBUG_ENV).as_deref() {
        Ok("1") | Ok("true") => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let settings_store = SettingsStore::new(data_dir.join("settings.json"))?;
        let database = Database::new(data_dir.join("klartext.sqlite3"))?;

        match cli.command.unwrap_or(Commands::Serve) {
            Commands::Serve => serve(database, &settings_store).await,
            Commands::Login { user_id, key } => {
                let credentials =
                    auth::exchange_key(&settings_store.current(), &database, &user_id, &key)
                        .await?;
                println!("Logged in as {}", credentials.user_id);
                Ok(())
            }
            Commands::Logout => {
                database.clear_credentials().await?;
                println!("Credentials removed");
                Ok(())
            }
            Commands::Status => status(&database).await,
            Commands::Flush => {
                let pipeline = FlushPipeline::new(database, &settings_store.current());
                report_flush(pipeline.flush().await);
                Ok(())
            }
            Commands::Toggle { hostname } => {
                let enabled = with_background(database, &settings_store, |handle| async move {
                    handle.toggle_extension(hostname.as_deref()).await
                })
                .await?;
                println!("Extension {}", if enabled { "enabled" } else { "disabled" });
                Ok(())
            }
            Commands::Block { hostname } => {
                let host = hostname.clone();
                let added = with_background(database, &settings_store, |handle| async move {
                    handle.block_site(&host).await
                })
                .await?;
                if added {
                    println!("Blocked {hostname}");
                } else {
                    println!("{hostname} was already blocked");
                }
                Ok(())
            }
            Commands::Config {
                server_url,
                level,
                auto_start,
            } => {
                let updated = settings_store.update(|settings| {
                    if let Some(url) = server_url {
                        settings.server_url = url;
                    }
                    if let Some(level) = level {
                        settings.simplification_level = level;
                    }
                    if let Some(auto_start) = auto_start {
                        settings.auto_start = auto_start;
                    }
                })?;
                println!("{}", serde_json::to_string_pretty(&updated)?);
                Ok(())
            }
        }
    })
}

async fn serve(database: Database, settings_store: &SettingsStore) -> Result<()> {
    let settings = settings_store.current();
    info!("klartext starting up against {}", settings.server_url);

    let mut scheduler = FlushScheduler::new();
    let buffer = TelemetryBuffer::new(database.clone())
        .with_immediate_flush(scheduler.trigger(), settings.flush.immediate_threshold);

    let background = BackgroundService::new(database.clone(), buffer.clone(), settings.clone());
    if let Err(err) = background.apply_auto_start().await {
        warn!("Failed to apply auto-start: {err:#}");
    }
    let cancel_token = CancellationToken::new();
    let (handle, background_task) = background.spawn(cancel_token.clone());

    let pipeline = FlushPipeline::new(database, &settings);
    scheduler.start(&settings.flush, move || {
        let pipeline = pipeline.clone();
        async move { report_flush(pipeline.flush().await) }
    })?;

    // Catch up on anything left above the threshold by the last run.
    if let Err(err) = buffer.check_immediate_flush().await {
        warn!("Initial threshold check failed: {err:#}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    drop(handle);
    cancel_token.cancel();
    scheduler.stop().await?;
    background_task
        .await
        .context("background context failed to join")?;
    Ok(())
}

async fn with_background<F, Fut, T>(
    database: Database,
    settings_store: &SettingsStore,
    request: F,
) -> Result<T>
where
    F: FnOnce(background::BackgroundHandle) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let buffer = TelemetryBuffer::new(database.clone());
    let cancel_token = CancellationToken::new();
    let (handle, task) = BackgroundService::new(database, buffer, settings_store.current())
        .spawn(cancel_token.clone());

    let result = request(handle).await;
    cancel_token.cancel();
    task.await.context("background context failed to join")?;
    result
}

async fn status(database: &Database) -> Result<()> {
    let enabled = database.is_enabled().await?;
    let user_id = database.user_id().await?;
    let has_key = database.api_key().await?.is_some();
    let (raw, survey) = database.buffered_counts().await?;

    println!("storage:          {}", database.path().display());
    println!("enabled:          {enabled}");
    println!("user id:          {}", user_id.as_deref().unwrap_or("-"));
    println!("api key stored:   {has_key}");
    println!("buffered raw:     {raw}");
    println!("buffered surveys: {survey}");
    Ok(())
}

fn report_flush(outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Completed { uploaded } => info!("Flush uploaded {uploaded} events"),
        FlushOutcome::Skipped(reason) => info!("Flush skipped: {reason:?}"),
        FlushOutcome::Aborted { uploaded, reason } => {
            error!("Flush aborted after {uploaded} events: {reason:?}")
        }
    }
}
