// Chat session for one conversation
// Drives the optimistic message list from user input, send acknowledgments,
// broadcasts and history pages

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::cache::{ConversationCache, ConversationDirectory};
use super::connection::{ConnectionManager, Subscription};
use super::history::{HistoryQuery, HistoryState, MessageHistory, DEFAULT_PAGE_SIZE};
use super::message_list::MessageList;
use crate::error::{ChatError, Result};
use crate::models::{DeliveryStatus, LastMessagePreview, Message, OutgoingMessage};

const EVENT_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub ack_timeout: Duration,
    pub max_send_attempts: u32,
    pub page_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            ack_timeout: Duration::from_secs(10),
            max_send_attempts: 3,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Collaborators owned by the application root and shared by every session.
#[derive(Clone)]
pub struct ChatServices {
    pub connection: Arc<ConnectionManager>,
    pub history: Arc<dyn MessageHistory>,
    pub conversations: ConversationCache,
    pub directory: Option<Arc<dyn ConversationDirectory>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered,
    Rejected(String),
    TimedOut,
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Broadcast(Message),
    Ack {
        temp_id: String,
        attempt: u32,
        outcome: SendOutcome,
    },
}

/// What an event did to the rendered list
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A local message was replaced by its server copy (server id)
    Confirmed(String),
    /// A message from someone else, or an unmatched echo (server id)
    Received(String),
    /// Acknowledged, waiting for the echo (temporary id)
    Sent(String),
    /// Marked failed (temporary id)
    Failed(String),
    Ignored,
}

struct PendingSend {
    attempt: u32,
    acknowledged: bool,
}

pub struct ChatSession {
    conversation_id: String,
    sender_id: String,
    list: MessageList,
    pending: HashMap<String, PendingSend>,
    services: ChatServices,
    subscription: Option<Subscription>,
    history_cursor: Option<String>,
    history_state: HistoryState,
    settings: SessionSettings,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl ChatSession {
    /// Join the conversation room and return an empty session.
    pub async fn open(
        services: ChatServices,
        conversation_id: &str,
        sender_id: &str,
        settings: SessionSettings,
    ) -> Result<Self> {
        let subscription = services.connection.join(conversation_id).await?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        info!("Opened chat session for {} in conversation {}", sender_id, conversation_id);

        Ok(ChatSession {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            list: MessageList::new(),
            pending: HashMap::new(),
            services,
            subscription: Some(subscription),
            history_cursor: None,
            history_state: HistoryState::Idle,
            settings,
            event_tx,
            event_rx,
        })
    }

    /// Render a new message right away and transmit it in the background.
    pub fn send_message(&mut self, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = self.list.add_local(text, &self.conversation_id, &self.sender_id);

        match self
            .services
            .conversations
            .patch_last_message(&self.conversation_id, LastMessagePreview::pending_from(&message))
        {
            Ok(true) => debug!("Patched conversation preview with pending message {}", message.id),
            Ok(false) => (),
            Err(e) => warn!("Could not patch conversation preview: {}", e),
        }

        self.pending.insert(
            message.id.clone(),
            PendingSend {
                attempt: 1,
                acknowledged: false,
            },
        );
        self.transmit(&message, 1);
        Ok(message)
    }

    /// Re-send a failed message with its original temporary id.
    pub fn retry(&mut self, message_id: &str) -> Result<Message> {
        let current = self
            .list
            .get(message_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownMessage(message_id.to_string()))?;
        if !current.failed_to_send {
            return Err(ChatError::NotFailed(message_id.to_string()));
        }

        let pending = self
            .pending
            .get_mut(message_id)
            .ok_or_else(|| ChatError::UnknownMessage(message_id.to_string()))?;
        if pending.attempt >= self.settings.max_send_attempts {
            return Err(ChatError::RetryLimitExceeded {
                id: message_id.to_string(),
                attempts: pending.attempt,
            });
        }
        pending.attempt += 1;
        pending.acknowledged = false;
        let attempt = pending.attempt;

        info!("Retrying message {} (attempt {}/{})", message_id, attempt, self.settings.max_send_attempts);
        let cleared = Message {
            failed_to_send: false,
            ..current
        };
        self.list.replace_local(cleared.clone());
        self.transmit(&cleared, attempt);
        Ok(cleared)
    }

    fn transmit(&self, message: &Message, attempt: u32) {
        let outgoing = OutgoingMessage::from(message);
        let connection = self.services.connection.clone();
        let events = self.event_tx.clone();
        let ack_timeout = self.settings.ack_timeout;
        let temp_id = message.id.clone();

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(ack_timeout, connection.send(outgoing)).await {
                Ok(Ok(ack)) if ack.success => SendOutcome::Delivered,
                Ok(Ok(ack)) => SendOutcome::Rejected(ack.error.unwrap_or_else(|| "rejected by server".to_string())),
                Ok(Err(e)) => SendOutcome::TransportError(e.to_string()),
                Err(_) => SendOutcome::TimedOut,
            };
            if events
                .send(SessionEvent::Ack {
                    temp_id,
                    attempt,
                    outcome,
                })
                .await
                .is_err()
            {
                debug!("Session closed before the acknowledgment arrived");
            }
        });
    }

    /// Reconcile a message delivered over the connection.
    pub fn receive_broadcast(&mut self, message: Message) -> SessionUpdate {
        if message.conversation_id != self.conversation_id {
            warn!(
                "Ignoring message {} for conversation {} in session for {}",
                message.id, message.conversation_id, self.conversation_id
            );
            return SessionUpdate::Ignored;
        }

        let reconciled = message
            .client_temp_id
            .as_ref()
            .filter(|temp_id| self.list.get(temp_id).is_some())
            .map(|temp_id| self.pending.remove(temp_id).is_some())
            .unwrap_or(false);

        let id = message.id.clone();
        self.list.replace_local(message);
        if reconciled {
            debug!("Confirmed local message as {}", id);
            SessionUpdate::Confirmed(id)
        } else {
            SessionUpdate::Received(id)
        }
    }

    async fn handle_ack(&mut self, temp_id: String, attempt: u32, outcome: SendOutcome) -> SessionUpdate {
        let current_attempt = match self.pending.get(&temp_id) {
            Some(pending) => pending.attempt,
            None => {
                // The echo already confirmed this message
                debug!("Acknowledgment for already confirmed message {}", temp_id);
                if outcome == SendOutcome::Delivered {
                    self.refresh_conversations().await;
                }
                return SessionUpdate::Ignored;
            }
        };
        if attempt != current_attempt {
            debug!("Ignoring acknowledgment for superseded attempt {} of {}", attempt, temp_id);
            return SessionUpdate::Ignored;
        }

        match outcome {
            SendOutcome::Delivered => {
                if let Some(pending) = self.pending.get_mut(&temp_id) {
                    pending.acknowledged = true;
                }
                info!("Message {} acknowledged by server", temp_id);
                self.refresh_conversations().await;
                SessionUpdate::Sent(temp_id)
            }
            failure => {
                error!("Failed to send message {} on attempt {}: {:?}", temp_id, attempt, failure);
                match self.list.get(&temp_id).cloned() {
                    Some(current) => {
                        self.list.replace_local(Message {
                            failed_to_send: true,
                            ..current
                        });
                        SessionUpdate::Failed(temp_id)
                    }
                    None => SessionUpdate::Ignored,
                }
            }
        }
    }

    async fn refresh_conversations(&self) {
        self.services.conversations.invalidate();
        if let Some(directory) = &self.services.directory {
            if let Err(e) = self.services.conversations.refetch(directory.as_ref()).await {
                warn!("Conversation list stays stale: {}", e);
            }
        }
    }

    /// Wait for the next broadcast or acknowledgment.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let subscription = self.subscription.as_mut()?;
        tokio::select! {
            Some(message) = subscription.recv() => Some(SessionEvent::Broadcast(message)),
            Some(event) = self.event_rx.recv() => Some(event),
            else => None,
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) -> SessionUpdate {
        match event {
            SessionEvent::Broadcast(message) => self.receive_broadcast(message),
            SessionEvent::Ack {
                temp_id,
                attempt,
                outcome,
            } => self.handle_ack(temp_id, attempt, outcome).await,
        }
    }

    pub async fn process_next(&mut self) -> Option<SessionUpdate> {
        let event = self.next_event().await?;
        Some(self.handle_event(event).await)
    }

    /// Fetch the next older page and put it in front of the rendered list.
    pub async fn load_older(&mut self) -> Result<usize> {
        if self.history_state == HistoryState::Exhausted {
            return Ok(0);
        }

        let mut query = HistoryQuery::new(&self.conversation_id).with_limit(self.settings.page_size);
        if let Some(cursor) = &self.history_cursor {
            query = query.with_cursor(cursor);
        }

        self.history_state = HistoryState::Loading;
        match self.services.history.fetch_page(&query).await {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                let inserted = self.list.prepend_history(messages);
                self.prune_reconciled();
                self.history_cursor = page.next_cursor;
                self.history_state = match self.history_cursor {
                    Some(_) => HistoryState::Idle,
                    None => HistoryState::Exhausted,
                };
                info!("Loaded {} older messages for {}", inserted, self.conversation_id);
                Ok(inserted)
            }
            Err(e) => {
                error!("Failed to load history for {}: {}", self.conversation_id, e);
                self.history_state = HistoryState::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Refetch the newest page and reseed the list, keeping pending messages.
    pub async fn reload(&mut self) -> Result<usize> {
        let query = HistoryQuery::new(&self.conversation_id).with_limit(self.settings.page_size);
        self.history_state = HistoryState::Loading;
        match self.services.history.fetch_page(&query).await {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                let count = messages.len();
                self.list.seed(messages);
                self.prune_reconciled();
                self.history_cursor = page.next_cursor;
                self.history_state = match self.history_cursor {
                    Some(_) => HistoryState::Idle,
                    None => HistoryState::Exhausted,
                };
                Ok(count)
            }
            Err(e) => {
                error!("Failed to reload history for {}: {}", self.conversation_id, e);
                self.history_state = HistoryState::Error(e.to_string());
                Err(e)
            }
        }
    }

    /// Forget pending sends whose local entry history already replaced.
    fn prune_reconciled(&mut self) {
        let list = &self.list;
        self.pending.retain(|id, _| list.get(id).is_some());
    }

    pub fn delivery_status(&self, message_id: &str) -> Option<DeliveryStatus> {
        let message = self.list.get(message_id)?;
        let status = if message.failed_to_send {
            DeliveryStatus::Failed
        } else if !message.is_temporary() {
            DeliveryStatus::Confirmed
        } else {
            match self.pending.get(message_id) {
                Some(pending) if pending.acknowledged => DeliveryStatus::Sent,
                _ => DeliveryStatus::Sending,
            }
        };
        Some(status)
    }

    /// Newest message still marked failed
    pub fn latest_failed(&self) -> Option<&Message> {
        self.list.messages().iter().rev().find(|m| m.failed_to_send)
    }

    pub fn messages(&self) -> &[Message] {
        self.list.messages()
    }

    pub fn message_list(&self) -> &MessageList {
        &self.list
    }

    pub fn history_state(&self) -> &HistoryState {
        &self.history_state
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Leave the conversation room.
    pub async fn close(mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            self.services.connection.leave(subscription).await?;
        }
        info!("Closed chat session for {}", self.conversation_id);
        Ok(())
    }
}
