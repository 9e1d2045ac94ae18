// Persistent connection management
// Owns the transport and routes broadcasts to the listeners of each joined room

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::error::{ChatError, Result};
use crate::models::{Message, OutgoingMessage, SendAck};

pub type ListenerId = u64;

/// A room-based persistent connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(&self, conversation_id: &str) -> Result<()>;
    async fn leave(&self, conversation_id: &str) -> Result<()>;
    async fn send(&self, message: OutgoingMessage) -> Result<SendAck>;
}

/// Held across transport join and leave calls for one room. The flag is
/// true while the transport is in the room.
type RoomGate = Arc<TokioMutex<bool>>;

#[derive(Default)]
struct Room {
    gate: RoomGate,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<Message>>,
}

#[derive(Default)]
struct Rooms {
    next_listener: ListenerId,
    // Entries are kept after the last listener leaves so every caller
    // shares one gate per room
    rooms: HashMap<String, Room>,
}

impl Rooms {
    fn gate(&mut self, conversation_id: &str) -> RoomGate {
        self.rooms.entry(conversation_id.to_string()).or_default().gate.clone()
    }

    fn add_listener(&mut self, conversation_id: &str, tx: mpsc::UnboundedSender<Message>) -> ListenerId {
        let listener_id = self.next_listener;
        self.next_listener += 1;
        self.rooms
            .entry(conversation_id.to_string())
            .or_default()
            .listeners
            .insert(listener_id, tx);
        listener_id
    }

    /// Returns true when the room has no listeners left.
    fn remove(&mut self, conversation_id: &str, listener_id: ListenerId) -> bool {
        match self.rooms.get_mut(conversation_id) {
            Some(room) => {
                room.listeners.remove(&listener_id);
                room.listeners.is_empty()
            }
            None => false,
        }
    }

    fn listener_count(&self, conversation_id: &str) -> usize {
        self.rooms
            .get(conversation_id)
            .map(|room| room.listeners.len())
            .unwrap_or(0)
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    rooms: Arc<Mutex<Rooms>>,
}

fn lock_rooms(rooms: &Mutex<Rooms>) -> std::sync::MutexGuard<'_, Rooms> {
    rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    /// Wrap a transport and spawn the loop dispatching its broadcast events.
    pub fn start(transport: Arc<dyn Transport>, mut events: mpsc::Receiver<Message>) -> Arc<Self> {
        let rooms = Arc::new(Mutex::new(Rooms::default()));
        let dispatch_rooms = rooms.clone();

        tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                let rooms = lock_rooms(&dispatch_rooms);
                let listeners = match rooms.rooms.get(&message.conversation_id) {
                    Some(room) if !room.listeners.is_empty() => &room.listeners,
                    _ => {
                        debug!("No listeners for conversation {}, dropping message {}", message.conversation_id, message.id);
                        continue;
                    }
                };

                // Listener channels are unbounded; an idle screen never holds up the others
                for target in listeners.values() {
                    if target.send(message.clone()).is_err() {
                        debug!("Listener went away before message {} was delivered", message.id);
                    }
                }
            }
            info!("Connection event stream ended");
        });

        Arc::new(ConnectionManager { transport, rooms })
    }

    /// Register a listener for a conversation, joining the room on the first one.
    ///
    /// Concurrent joins for one room wait for each other. A listener is only
    /// registered once the transport is in the room.
    pub async fn join(self: &Arc<Self>, conversation_id: &str) -> Result<Subscription> {
        let gate = lock_rooms(&self.rooms).gate(conversation_id);
        let mut joined = gate.lock().await;

        if *joined {
            debug!("Conversation {} already joined, adding listener", conversation_id);
        } else {
            info!("Joining conversation room {}", conversation_id);
            if let Err(e) = self.transport.join(conversation_id).await {
                error!("Failed to join conversation {}: {}", conversation_id, e);
                return Err(e);
            }
            *joined = true;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = lock_rooms(&self.rooms).add_listener(conversation_id, tx);
        drop(joined);

        Ok(Subscription {
            conversation_id: conversation_id.to_string(),
            listener_id,
            rx,
            manager: self.clone(),
            detached: false,
        })
    }

    /// Remove one listener, leaving the room when it was the last.
    pub async fn leave(&self, mut subscription: Subscription) -> Result<()> {
        subscription.detached = true;
        let conversation_id = subscription.conversation_id.clone();
        let last = lock_rooms(&self.rooms).remove(&conversation_id, subscription.listener_id);
        if last {
            self.leave_if_idle(&conversation_id).await?;
        }
        Ok(())
    }

    /// Leave the room unless a listener joined again in the meantime.
    async fn leave_if_idle(&self, conversation_id: &str) -> Result<()> {
        let gate = lock_rooms(&self.rooms).gate(conversation_id);
        let mut joined = gate.lock().await;
        if !*joined || self.listener_count(conversation_id) > 0 {
            return Ok(());
        }

        info!("Leaving conversation room {}", conversation_id);
        let result = self.transport.leave(conversation_id).await;
        *joined = false;
        result
    }

    /// Transmit a message to a room this connection has joined.
    pub async fn send(&self, message: OutgoingMessage) -> Result<SendAck> {
        if self.listener_count(&message.conversation_id) == 0 {
            return Err(ChatError::NotJoined(message.conversation_id));
        }
        self.transport.send(message).await
    }

    pub fn listener_count(&self, conversation_id: &str) -> usize {
        lock_rooms(&self.rooms).listener_count(conversation_id)
    }

    /// Rooms with at least one listener, sorted
    pub fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = lock_rooms(&self.rooms)
            .rooms
            .iter()
            .filter(|(_, room)| !room.listeners.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        rooms.sort();
        rooms
    }
}

/// One listener registration. Dropping it unregisters the listener.
pub struct Subscription {
    conversation_id: String,
    listener_id: ListenerId,
    rx: mpsc::UnboundedReceiver<Message>,
    manager: Arc<ConnectionManager>,
    detached: bool,
}

impl Subscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let last = lock_rooms(&self.manager.rooms).remove(&self.conversation_id, self.listener_id);
        if !last {
            return;
        }

        let manager = self.manager.clone();
        let conversation_id = self.conversation_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.leave_if_idle(&conversation_id).await {
                        warn!("Failed to leave conversation {}: {}", conversation_id, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to leave conversation {} on drop", conversation_id),
        }
    }
}
