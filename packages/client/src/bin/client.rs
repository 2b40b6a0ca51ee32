//! Terminal chat client for kizuna.
//!
//! Connects to the realtime endpoint with a bearer token, joins presence and
//! sends lines from stdin to one conversation. Reconnection, acknowledgment
//! retries and typing indicators are handled by the sync session.
//! Exits with status 1 on authentication failure or when reconnecting gives up.
//!
//! Run with:
//! ```not_rust
//! KIZUNA_TOKEN=... cargo run --bin kizuna-client -- --subject-id alice --conversation dm:alice:bob
//! cargo run --bin kizuna-client -- -s bob -c dm:alice:bob --token ... --config kizuna.json
//! ```

use std::path::PathBuf;

use clap::Parser;

use kizuna_client::{ClientOptions, error::ClientError, run_client};
use kizuna_shared::logger::setup_logger;
use kizuna_sync::{
    SyncConfig,
    domain::{ConversationKey, SubjectId},
};

#[derive(Parser, Debug)]
#[command(name = "kizuna-client")]
#[command(about = "Terminal chat client with presence, delivery tracking and typing indicators", long_about = None)]
struct Args {
    /// Subject ID to join as
    #[arg(short = 's', long)]
    subject_id: String,

    /// Conversation key to chat in (e.g. dm:alice:bob, group:team)
    #[arg(short = 'c', long)]
    conversation: String,

    /// Bearer token presented on connect
    #[arg(short = 't', long, env = "KIZUNA_TOKEN", hide_env_values = true)]
    token: String,

    /// WebSocket endpoint, overrides the config file
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Base URL of the message history API
    #[arg(long)]
    history_url: Option<String>,

    /// Base URL of the presence persistence API
    #[arg(long)]
    presence_url: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_options(args: Args) -> Result<ClientOptions, ClientError> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
            SyncConfig::from_json(&json)
                .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?
        }
        None => SyncConfig::default(),
    };
    if let Some(url) = args.url {
        config.connection.url = url;
    }

    Ok(ClientOptions {
        config,
        subject: SubjectId::new(args.subject_id)?,
        conversation: ConversationKey::new(args.conversation)?,
        token: args.token,
        history_url: args.history_url,
        presence_url: args.presence_url,
    })
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();
    let options = match load_options(args) {
        Ok(options) => options,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run_client(options).await {
        tracing::error!("Client error: {}", e);
        std::process::exit(1);
    }
}
