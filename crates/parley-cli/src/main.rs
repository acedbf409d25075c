use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parley_messaging::store::fs::{FsDeviceKeyStore, FsStore};
use parley_messaging::Messenger;
use parley_protocol::DecryptedMessage;
use tracing::info;

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "parley", about = "End-to-end encrypted direct messages")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Environment variable holding the key file passphrase, overrides config
    #[arg(long)]
    passphrase_env: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or load the identity key pair and print the public key
    Init {
        #[arg(short, long)]
        user: String,
    },
    /// Start a conversation with a peer and print its id
    Create {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        peer: String,
    },
    /// Encrypt and send a message
    Send {
        #[arg(short, long)]
        user: String,
        #[arg(short = 'c', long)]
        conversation: String,
        text: String,
    },
    /// Print the decrypted history of a conversation
    History {
        #[arg(short, long)]
        user: String,
        #[arg(short = 'c', long)]
        conversation: String,
    },
    /// Print messages as they arrive until interrupted
    Follow {
        #[arg(short, long)]
        user: String,
        #[arg(short = 'c', long)]
        conversation: String,
    },
    /// Mark every message from the peer as read
    MarkRead {
        #[arg(short, long)]
        user: String,
        #[arg(short = 'c', long)]
        conversation: String,
    },
    /// Establish (or repair) the conversation's session key and show its state
    Session {
        #[arg(short, long)]
        user: String,
        #[arg(short = 'c', long)]
        conversation: String,
    },
}

fn load_config(args: &Args) -> Result<CliConfig> {
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", config_path.display()))?
    } else {
        CliConfig::default()
    };

    // CLI overrides
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(var) = &args.passphrase_env {
        config.passphrase_env = Some(var.clone());
    }
    Ok(config)
}

fn build_messenger(config: &CliConfig) -> Result<Messenger> {
    let shared = Arc::new(FsStore::new(config.shared_dir()));
    let mut device = FsDeviceKeyStore::new(config.device_dir());
    if let Some(var) = &config.passphrase_env {
        let passphrase = std::env::var(var)
            .with_context(|| format!("passphrase variable {var} is not set"))?;
        if passphrase.is_empty() {
            bail!("passphrase variable {var} is empty");
        }
        device = device.with_passphrase(passphrase);
    }
    Ok(Messenger::new(
        shared.clone(),
        shared,
        Arc::new(device),
        config.messaging.clone(),
    ))
}

fn print_message(message: &DecryptedMessage) {
    let lock = if message.encrypted { "" } else { " (unencrypted)" };
    println!("[{}] {}{}: {}", message.created_at, message.sender_id, lock, message.text);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(data_dir = %config.data_dir.display(), "using data directory");
    let messenger = build_messenger(&config)?;

    match args.command {
        Command::Init { user } => {
            messenger.identity().ensure_key_pair(&user).await?;
            let pair = messenger.identity().private_key_of(&user)?;
            println!("{}", pair.export_public());
        }
        Command::Create { user, peer } => {
            let id = messenger.create_conversation(&user, &peer).await?;
            println!("{id}");
        }
        Command::Send {
            user,
            conversation,
            text,
        } => {
            let peer = messenger.peer_of(&conversation, &user).await?;
            let message = messenger
                .send_message(&conversation, &user, &peer, &text)
                .await
                .context("failed to send message")?;
            println!("{}", message.message_id);
        }
        Command::History { user, conversation } => {
            for message in messenger.history(&conversation, &user).await? {
                print_message(&message);
            }
        }
        Command::Follow { user, conversation } => {
            let feed = messenger
                .on_messages(&conversation, &user, |batch| {
                    batch.iter().for_each(print_message);
                })
                .await?;
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            feed.close();
        }
        Command::MarkRead { user, conversation } => {
            messenger.mark_conversation_read(&conversation, &user).await?;
        }
        Command::Session { user, conversation } => {
            let peer = messenger.peer_of(&conversation, &user).await?;
            let session_id = messenger
                .sessions()
                .ensure_session(&conversation, &user, &peer)
                .await?;
            println!("{session_id}");
            println!("{:?}", messenger.sessions().session_state(&conversation));
        }
    }

    Ok(())
}
