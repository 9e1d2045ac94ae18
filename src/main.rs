#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use dugout::api::HttpApi;
use dugout::chat::{ChatServices, ChatSession, ConnectionManager, ConversationCache, QueryCache};
use dugout::config::{load_config, save_config, set_config_path_override};
use dugout::models::{Conversation, DeliveryStatus};
use dugout::transport::{LoopbackServer, TcpTransport};

/// Command line arguments for dugout
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "dugout: chat with your team from the terminal.",
    long_about = "dugout joins one club conversation, shows its history and sends messages.\n\n\
    Type a line to send it. Commands:\n\
    /older   load older messages\n\
    /retry   re-send the newest failed message\n\
    /quit    leave the conversation"
)]
struct Args {
    /// Conversation to open
    #[arg(long, short)]
    conversation: String,

    /// Config file to use instead of the default one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run against an in-process server instead of the club backend
    #[arg(long)]
    offline: bool,

    /// Where to write the log
    #[arg(long, value_name = "PATH", default_value = "dugout.log")]
    log_file: PathBuf,

    /// Log at debug level
    #[arg(long, short)]
    verbose: bool,
}

fn status_marker(status: Option<DeliveryStatus>) -> &'static str {
    match status {
        Some(DeliveryStatus::Sending) => " (sending)",
        Some(DeliveryStatus::Sent) => " (sent)",
        Some(DeliveryStatus::Failed) => " (failed, /retry to resend)",
        Some(DeliveryStatus::Confirmed) | None => "",
    }
}

fn print_messages(session: &ChatSession) {
    const TAIL: usize = 15;
    let messages = session.messages();
    let skip = messages.len().saturating_sub(TAIL);

    println!("---- {} ----", session.conversation_id());
    for message in &messages[skip..] {
        println!(
            "[{}] {}: {}{}",
            message.created_at.format("%H:%M"),
            message.sender_id,
            message.text,
            status_marker(session.delivery_status(&message.id))
        );
    }
}

async fn build_services(offline: bool, conversation_id: &str, api_base_url: &str, socket_addr: &str) -> Result<ChatServices> {
    let conversations = ConversationCache::new(Arc::new(QueryCache::new()));

    let services = if offline {
        let (server, events) = LoopbackServer::new();
        server.insert_conversation(Conversation {
            id: conversation_id.to_string(),
            title: conversation_id.to_string(),
            created_at: chrono::Utc::now(),
        });
        ChatServices {
            connection: ConnectionManager::start(server.clone(), events),
            history: server.clone(),
            conversations,
            directory: Some(server),
        }
    } else {
        let (transport, events) = TcpTransport::connect(socket_addr).await?;
        let api = Arc::new(HttpApi::new(api_base_url)?);
        ChatServices {
            connection: ConnectionManager::start(transport, events),
            history: api.clone(),
            conversations,
            directory: Some(api),
        }
    };

    if let Some(directory) = &services.directory {
        if let Err(e) = services.conversations.refetch(directory.as_ref()).await {
            warn!("Starting without a conversation list: {}", e);
        }
    }
    Ok(services)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.to_str(), level)?;
    info!("dugout starting up");
    info!("Logging to file: {}", args.log_file.display());

    if let Some(path) = &args.config {
        set_config_path_override(path.clone());
    }
    let mut config = load_config()?;
    config.apply_env_overrides();

    if config.user_id.is_empty() {
        eprintln!("Enter your club user id:");
        config.user_id = utils::read_line()?;
        if config.user_id.is_empty() {
            anyhow::bail!("A user id is required");
        }
        save_config(&config)?;
    }

    println!("Opening {} as {}... please wait...\n", args.conversation, config.user_id);
    let services = build_services(args.offline, &args.conversation, &config.api_base_url, &config.socket_addr).await?;
    let mut session = ChatSession::open(services, &args.conversation, &config.user_id, config.session_settings()).await?;

    if let Err(e) = session.load_older().await {
        eprintln!("Could not load messages: {} (type /older to try again)", e);
    }
    print_messages(&session);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                match line.trim() {
                    "/quit" => break,
                    "/older" => match session.load_older().await {
                        Ok(0) => println!("No older messages."),
                        Ok(count) => debug!("Loaded {} older messages", count),
                        Err(e) => eprintln!("Could not load messages: {}", e),
                    },
                    "/retry" => {
                        let failed = session.latest_failed().map(|m| m.id.clone());
                        match failed {
                            Some(id) => {
                                if let Err(e) = session.retry(&id) {
                                    eprintln!("Cannot retry: {}", e);
                                }
                            }
                            None => println!("Nothing to retry."),
                        }
                    }
                    "" => continue,
                    _ => {
                        if let Err(e) = session.send_message(&line) {
                            eprintln!("Cannot send: {}", e);
                        }
                    }
                }
                print_messages(&session);
            }
            update = session.process_next() => {
                match update {
                    Some(update) => {
                        debug!("Session update: {:?}", update);
                        print_messages(&session);
                    }
                    None => break,
                }
            }
        }
    }

    session.close().await?;
    info!("dugout shutting down");
    Ok(())
}
