// Common test utilities for integration tests
// Shared loopback setup, message builders and event waiting helpers

use std::sync::{Arc, Once};

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use log::{info, LevelFilter};
use tokio::time::{timeout, Duration as TokioDuration};

use dugout::chat::{
    ChatServices, ChatSession, ConnectionManager, ConversationCache, QueryCache, SessionSettings, SessionUpdate,
};
use dugout::models::{Conversation, Message};
use dugout::transport::LoopbackServer;

pub const CONVERSATION: &str = "u14-gold";
pub const ME: &str = "player-7";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub struct Harness {
    pub server: Arc<LoopbackServer>,
    pub services: ChatServices,
}

/// Loopback server wired into a full set of services
pub fn loopback_harness() -> Harness {
    let (server, events) = LoopbackServer::new();
    server.insert_conversation(Conversation {
        id: CONVERSATION.to_string(),
        title: "U14 Gold".to_string(),
        created_at: Utc::now(),
    });

    let services = ChatServices {
        connection: ConnectionManager::start(server.clone(), events),
        history: server.clone(),
        conversations: ConversationCache::new(Arc::new(QueryCache::new())),
        directory: Some(server.clone()),
    };
    Harness { server, services }
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        ack_timeout: std::time::Duration::from_millis(200),
        max_send_attempts: 3,
        page_size: 20,
    }
}

pub async fn open_session(harness: &Harness, settings: SessionSettings) -> Result<ChatSession> {
    Ok(ChatSession::open(harness.services.clone(), CONVERSATION, ME, settings).await?)
}

/// Confirmed history message number `index`, one minute apart
pub fn history_message(index: usize) -> Message {
    Message {
        id: format!("srv-{:03}", index),
        conversation_id: CONVERSATION.to_string(),
        sender_id: if index % 2 == 0 { "coach-ray" } else { "parent-4" }.to_string(),
        text: format!("history message {}", index),
        created_at: Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap() + Duration::minutes(index as i64),
        failed_to_send: false,
        client_temp_id: None,
    }
}

pub fn history_messages(count: usize) -> Vec<Message> {
    (0..count).map(history_message).collect()
}

/// Wait for the next session update
pub async fn next_update(session: &mut ChatSession) -> Result<SessionUpdate> {
    match timeout(TokioDuration::from_secs(2), session.process_next()).await {
        Ok(Some(update)) => Ok(update),
        Ok(None) => Err(anyhow::anyhow!("Session event stream closed")),
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for a session update")),
    }
}

/// Process updates until one matches the predicate
pub async fn wait_for_update(
    session: &mut ChatSession,
    predicate: impl Fn(&SessionUpdate) -> bool,
    timeout_secs: u64,
) -> Result<SessionUpdate> {
    info!("Waiting for session update...");
    match timeout(TokioDuration::from_secs(timeout_secs), async {
        while let Some(update) = session.process_next().await {
            if predicate(&update) {
                return Ok(update);
            }
        }
        Err(anyhow::anyhow!("Session event stream closed"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for session update")),
    }
}
