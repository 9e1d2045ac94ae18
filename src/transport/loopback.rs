//! In-process chat server.
//!
//! Stands in for the real backend in tests and offline mode: it assigns
//! server ids, echoes the client's temporary id, broadcasts to joined rooms,
//! serves history pages and the conversation list, and can be told how to
//! acknowledge sends.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::cache::ConversationDirectory;
use crate::chat::connection::Transport;
use crate::chat::history::{HistoryQuery, MessageHistory};
use crate::error::{ChatError, Result};
use crate::models::{
    Conversation, ConversationPage, ConversationSummary, HistoryPage, LastMessagePreview, Message,
    OutgoingMessage, SendAck,
};

/// How the server answers `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    /// Store, broadcast the echo, acknowledge
    Succeed,
    /// Store and acknowledge without broadcasting
    AckWithoutEcho,
    /// Reject the message
    Fail,
    /// Never answer
    Drop,
}

struct ServerState {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>, // oldest first
    joined: HashSet<String>,
    join_calls: usize,
    transmissions: Vec<OutgoingMessage>,
    behavior: AckBehavior,
    history_failure: Option<String>,
}

pub struct LoopbackServer {
    state: Mutex<ServerState>,
    events: mpsc::Sender<Message>,
}

impl LoopbackServer {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (events, events_rx) = mpsc::channel(100);
        let server = LoopbackServer {
            state: Mutex::new(ServerState {
                conversations: Vec::new(),
                messages: HashMap::new(),
                joined: HashSet::new(),
                join_calls: 0,
                transmissions: Vec::new(),
                behavior: AckBehavior::Succeed,
                history_failure: None,
            }),
            events,
        };
        (Arc::new(server), events_rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ack_behavior(&self, behavior: AckBehavior) {
        self.lock().behavior = behavior;
    }

    /// Make history requests fail with `reason`, or succeed again with None.
    pub fn set_history_failure(&self, reason: Option<&str>) {
        self.lock().history_failure = reason.map(|r| r.to_string());
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        let mut state = self.lock();
        if !state.conversations.iter().any(|c| c.id == conversation.id) {
            state.conversations.push(conversation);
        }
    }

    /// Store messages as existing history, oldest first.
    pub fn insert_history(&self, messages: Vec<Message>) {
        let mut state = self.lock();
        for message in messages {
            state
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
    }

    /// Store a message posted by another participant and broadcast it.
    pub async fn publish(&self, sender_id: &str, conversation_id: &str, text: &str) -> Message {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            failed_to_send: false,
            client_temp_id: None,
        };
        self.store_and_broadcast(message.clone(), true).await;
        message
    }

    async fn store_and_broadcast(&self, message: Message, broadcast: bool) {
        let joined = {
            let mut state = self.lock();
            state
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message.clone());
            state.joined.contains(&message.conversation_id)
        };
        if broadcast && joined {
            if self.events.send(message).await.is_err() {
                debug!("Loopback event receiver dropped");
            }
        }
    }

    pub fn stored(&self, conversation_id: &str) -> Vec<Message> {
        self.lock().messages.get(conversation_id).cloned().unwrap_or_default()
    }

    pub fn transmissions(&self) -> Vec<OutgoingMessage> {
        self.lock().transmissions.clone()
    }

    pub fn join_calls(&self) -> usize {
        self.lock().join_calls
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        self.lock().joined.contains(conversation_id)
    }
}

#[async_trait]
impl Transport for LoopbackServer {
    async fn join(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.join_calls += 1;
        state.joined.insert(conversation_id.to_string());
        Ok(())
    }

    async fn leave(&self, conversation_id: &str) -> Result<()> {
        self.lock().joined.remove(conversation_id);
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<SendAck> {
        let behavior = {
            let mut state = self.lock();
            state.transmissions.push(message.clone());
            state.behavior
        };

        match behavior {
            AckBehavior::Fail => Ok(SendAck::failed("rejected by loopback server")),
            AckBehavior::Drop => std::future::pending().await,
            AckBehavior::Succeed | AckBehavior::AckWithoutEcho => {
                let stored = Message {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: message.conversation_id,
                    sender_id: message.sender_id,
                    text: message.text,
                    created_at: Utc::now(),
                    failed_to_send: false,
                    client_temp_id: Some(message.client_temp_id),
                };
                info!("Loopback stored message {}", stored.id);
                self.store_and_broadcast(stored, behavior == AckBehavior::Succeed).await;
                Ok(SendAck::ok())
            }
        }
    }
}

#[async_trait]
impl MessageHistory for LoopbackServer {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let state = self.lock();
        if let Some(reason) = &state.history_failure {
            return Err(ChatError::History(reason.clone()));
        }

        let all = match state.messages.get(&query.conversation_id) {
            Some(messages) => messages,
            None => return Ok(HistoryPage::default()),
        };

        // The cursor names the oldest message already delivered
        let end = match &query.cursor {
            Some(cursor) => all
                .iter()
                .position(|m| &m.id == cursor)
                .ok_or_else(|| ChatError::History(format!("Unknown cursor {}", cursor)))?,
            None => all.len(),
        };
        let start = end.saturating_sub(query.limit);

        let mut messages: Vec<Message> = all[start..end].to_vec();
        messages.reverse();
        let next_cursor = if start > 0 { Some(all[start].id.clone()) } else { None };

        Ok(HistoryPage { messages, next_cursor })
    }
}

#[async_trait]
impl ConversationDirectory for LoopbackServer {
    async fn fetch_conversations(&self, _cursor: Option<&str>) -> Result<ConversationPage> {
        let state = self.lock();
        let conversations = state
            .conversations
            .iter()
            .map(|conversation| ConversationSummary {
                conversation: conversation.clone(),
                last_message: state.messages.get(&conversation.id).and_then(|messages| messages.last()).map(|last| {
                    LastMessagePreview {
                        message_id: last.id.clone(),
                        sender_id: last.sender_id.clone(),
                        text: last.text.clone(),
                        created_at: last.created_at,
                        pending: false,
                    }
                }),
            })
            .collect();
        Ok(ConversationPage {
            conversations,
            next_cursor: None,
        })
    }
}
