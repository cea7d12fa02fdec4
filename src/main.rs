use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tgrelay::config::Config;
use tgrelay::error::{RelayError, Result};
use tgrelay::relay::RelayEngine;
use tgrelay::session::telegram::SessionManager;
use tgrelay::session::{LoginOutcome, MessagingSession};

#[derive(Parser)]
#[command(name = "tgrelay", version, about = "Telegram channel relay daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to Telegram (requests a verification code for the phone)
    Login {
        /// Phone number in international format
        #[arg(short, long)]
        phone: Option<String>,
    },
    /// List channels and groups visible to the account
    Channels,
    /// Relay new source-channel messages until stopped
    Run,
    /// Copy the most recent source messages once, oldest first
    CopyRecent {
        /// Number of messages to copy
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show login state and configured channels
    Status,
    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current config
    Show,
    /// Set a config value by key
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Login { phone } => login(&config_path, phone).await,
        Commands::Channels => channels(&config_path).await,
        Commands::Run => run(&config_path).await,
        Commands::CopyRecent { limit } => copy_recent(&config_path, limit).await,
        Commands::Status => status(&config_path).await,
        Commands::Config { action } => manage_config(&config_path, action),
    }
}

fn manager(config: &Config, config_path: &Path) -> Result<Arc<SessionManager>> {
    let (api_id, api_hash) = config.credentials()?;
    let session_file = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("session");
    Ok(Arc::new(SessionManager::new(api_id, api_hash, session_file)))
}

fn prompt(label: &str) -> Result<String> {
    inquire::Text::new(label)
        .prompt()
        .map_err(|e| RelayError::Auth(format!("prompt failed: {e}")))
}

async fn login(config_path: &Path, phone: Option<String>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    let session = manager(&config, config_path)?;
    session.connect().await?;

    let phone = match phone.filter(|p| !p.is_empty()) {
        Some(phone) => phone,
        None if !config.phone_number.is_empty() => config.phone_number.clone(),
        None => prompt("Phone number (international format):")?,
    };

    match session.start_login(&phone).await? {
        LoginOutcome::AlreadyAuthorized => println!("Already logged in."),
        LoginOutcome::CodeSent(challenge) => {
            println!("Verification code sent to {phone}.");
            let code = prompt("Verification code:")?;
            session.verify_code(code.trim(), &challenge).await?;
            println!("Login successful.");
        }
    }

    if config.phone_number != phone {
        config.phone_number = phone;
        config.save(config_path)?;
    }
    session.disconnect().await;
    Ok(())
}

async fn channels(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let session = manager(&config, config_path)?;
    session.connect().await?;

    let channels = session.list_channels().await;
    if channels.is_empty() {
        println!("No channels visible. Are you logged in?");
    }
    for channel in channels {
        let handle = channel
            .username
            .map(|u| format!(" (@{u})"))
            .unwrap_or_default();
        println!(
            "{:>14}  {:<7}  {}{}",
            channel.id, channel.kind, channel.title, handle
        );
    }
    session.disconnect().await;
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    config.require_channels()?;
    let session = manager(&config, config_path)?;
    session.connect().await?;

    let engine = RelayEngine::new(session.clone());
    engine
        .start(&config.source_channel_id, &config.destination_channel_id)
        .await?;
    info!("relay running, press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let _ = engine.request_stop();
        }
        _ = engine.wait() => {}
    }
    engine.wait().await;
    session.disconnect().await;
    Ok(())
}

async fn copy_recent(config_path: &Path, limit: usize) -> Result<()> {
    let config = Config::load(config_path)?;
    config.require_channels()?;
    let session = manager(&config, config_path)?;
    session.connect().await?;

    let engine = RelayEngine::new(session.clone());
    let replayed = engine
        .copy_recent(
            &config.source_channel_id,
            &config.destination_channel_id,
            limit,
        )
        .await?;
    println!("Replayed {replayed} message(s).");
    session.disconnect().await;
    Ok(())
}

async fn status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let logged_in = match manager(&config, config_path) {
        Ok(session) => session.is_authorized().await,
        Err(_) => false,
    };

    println!("Logged in:   {}", if logged_in { "yes" } else { "no" });
    println!("Source:      {}", display_or_unset(&config.source_channel_id));
    println!(
        "Destination: {}",
        display_or_unset(&config.destination_channel_id)
    );
    Ok(())
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(unset)"
    } else {
        value
    }
}

fn manage_config(config_path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load(config_path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(config_path)?;
            config.set(&key, &value)?;
            config.save(config_path)?;
            println!("{key} updated.");
        }
    }
    Ok(())
}
