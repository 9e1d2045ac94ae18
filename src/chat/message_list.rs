//! The rendered message list for one conversation.
//!
//! Confirmed history and locally pending messages live in one ordered list.
//! Local entries carry a temporary id until a server message that names them
//! in `client_temp_id` replaces them in place.

use chrono::Utc;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{Message, TEMP_ID_SUFFIX};

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Build a temporary message id: creation millis, a process-wide sequence
/// number and a random salt, followed by the temporary suffix.
pub fn generate_temp_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let salt = rand::random::<u16>();
    format!("{}-{}-{:04x}{}", millis, sequence, salt, TEMP_ID_SUFFIX)
}

/// Where `replace_local` put the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replaced {
    InPlace(usize),
    Appended(usize),
}

#[derive(Debug, Default, Clone)]
pub struct MessageList {
    server_messages: Vec<Message>,
    rendered: Vec<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the confirmed history, keeping pending local entries after it.
    pub fn seed(&mut self, server_messages: Vec<Message>) {
        let pending: Vec<Message> = self
            .rendered
            .drain(..)
            .filter(|m| m.is_temporary())
            .collect();

        self.server_messages.clear();
        for message in server_messages {
            if !self.server_messages.iter().any(|m| m.id == message.id) {
                self.server_messages.push(message);
            }
        }
        self.rendered = self.server_messages.clone();

        for local in pending {
            let reconciled = self
                .server_messages
                .iter()
                .any(|m| m.client_temp_id.as_deref() == Some(local.id.as_str()));
            if !reconciled {
                self.rendered.push(local);
            }
        }
    }

    /// Append a new pending message and return it for transmission.
    pub fn add_local(&mut self, text: &str, conversation_id: &str, sender_id: &str) -> Message {
        let mut id = generate_temp_id();
        while self.position_of(&id).is_some() {
            id = generate_temp_id();
        }

        let message = Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            failed_to_send: false,
            client_temp_id: None,
        };
        debug!("Added local message {} to conversation {}", message.id, conversation_id);
        self.rendered.push(message.clone());
        message
    }

    /// Replace the entry matching `updated` in place, or append it.
    ///
    /// An entry matches when its id equals `updated.id`, or else when its id
    /// equals `updated.client_temp_id`. If both match different entries the
    /// id match is replaced and the stale temporary entry is dropped, so ids
    /// stay unique.
    pub fn replace_local(&mut self, updated: Message) -> Replaced {
        let by_id = self.position_of(&updated.id);
        let by_temp_id = updated
            .client_temp_id
            .as_deref()
            .and_then(|temp_id| self.position_of(temp_id));

        if !updated.is_temporary() {
            self.record_confirmed(&updated);
        }

        match (by_id, by_temp_id) {
            (Some(index), Some(stale)) if index != stale => {
                debug!("Message {} already rendered, dropping stale local entry", updated.id);
                self.rendered[index] = updated;
                self.rendered.remove(stale);
                Replaced::InPlace(if stale < index { index - 1 } else { index })
            }
            (Some(index), _) | (None, Some(index)) => {
                debug!("Replacing message at position {} with {}", index, updated.id);
                self.rendered[index] = updated;
                Replaced::InPlace(index)
            }
            (None, None) => {
                debug!("No match for message {}, appending", updated.id);
                self.rendered.push(updated);
                Replaced::Appended(self.rendered.len() - 1)
            }
        }
    }

    /// Put an older page (oldest first) in front of everything rendered.
    /// Returns the number of messages inserted.
    pub fn prepend_history(&mut self, older: Vec<Message>) -> usize {
        let mut fresh: Vec<Message> = Vec::with_capacity(older.len());

        for message in older {
            if self.position_of(&message.id).is_some() || fresh.iter().any(|m| m.id == message.id) {
                continue;
            }
            if let Some(index) = message
                .client_temp_id
                .as_deref()
                .and_then(|temp_id| self.position_of(temp_id))
            {
                self.record_confirmed(&message);
                self.rendered[index] = message;
                continue;
            }
            fresh.push(message);
        }

        let inserted = fresh.len();
        self.server_messages.splice(0..0, fresh.iter().cloned());
        self.rendered.splice(0..0, fresh);
        inserted
    }

    pub fn messages(&self) -> &[Message] {
        &self.rendered
    }

    pub fn server_messages(&self) -> &[Message] {
        &self.server_messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.rendered.iter().find(|m| m.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.rendered.iter().filter(|m| m.is_temporary())
    }

    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.rendered.iter().position(|m| m.id == id)
    }

    fn record_confirmed(&mut self, message: &Message) {
        match self.server_messages.iter().position(|m| m.id == message.id) {
            Some(index) => self.server_messages[index] = message.clone(),
            None => self.server_messages.push(message.clone()),
        }
    }
}
