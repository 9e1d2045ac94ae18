//! Query cache shared across screens, and the conversation-list view of it.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ChatError, Result};
use crate::models::{ConversationPage, LastMessagePreview};

/// Tag under which the conversation list is cached.
pub const CONVERSATIONS_TAG: &str = "conversations";

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    stale: bool,
}

/// Key-value cache of JSON values keyed by tag. Typed reads check the
/// stored value against the requested schema.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, tag: &str) -> Result<Option<T>> {
        let value = match self.lock().get(tag) {
            Some(entry) => entry.value.clone(),
            None => return Ok(None),
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ChatError::CacheSchema(format!("{}: {}", tag, e)))
    }

    pub fn put<T: Serialize>(&self, tag: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.lock().insert(tag.to_string(), CacheEntry { value, stale: false });
        Ok(())
    }

    /// Mark an entry stale. Returns false when nothing was cached.
    pub fn invalidate(&self, tag: &str) -> bool {
        match self.lock().get_mut(tag) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    pub fn is_stale(&self, tag: &str) -> bool {
        self.lock().get(tag).map(|entry| entry.stale).unwrap_or(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned lock still holds a usable map
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Source of the cursor-paginated conversation list
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn fetch_conversations(&self, cursor: Option<&str>) -> Result<ConversationPage>;
}

/// The conversation list entry of a `QueryCache`.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    cache: Arc<QueryCache>,
}

impl ConversationCache {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        ConversationCache { cache }
    }

    pub fn read(&self) -> Result<Option<ConversationPage>> {
        self.cache.get(CONVERSATIONS_TAG)
    }

    pub fn write(&self, page: &ConversationPage) -> Result<()> {
        self.cache.put(CONVERSATIONS_TAG, page)
    }

    /// Overwrite the last-message preview of one conversation.
    /// Returns false when the list is not cached or lacks the conversation.
    pub fn patch_last_message(&self, conversation_id: &str, preview: LastMessagePreview) -> Result<bool> {
        let mut page = match self.read()? {
            Some(page) => page,
            None => {
                debug!("No cached conversation list to patch");
                return Ok(false);
            }
        };

        let summary = match page
            .conversations
            .iter_mut()
            .find(|summary| summary.conversation.id == conversation_id)
        {
            Some(summary) => summary,
            None => {
                debug!("Conversation {} not in cached list", conversation_id);
                return Ok(false);
            }
        };
        summary.last_message = Some(preview);

        self.write(&page)?;
        Ok(true)
    }

    pub fn invalidate(&self) -> bool {
        self.cache.invalidate(CONVERSATIONS_TAG)
    }

    pub fn is_stale(&self) -> bool {
        self.cache.is_stale(CONVERSATIONS_TAG)
    }

    /// Replace the cached list with the first page from the directory.
    pub async fn refetch(&self, directory: &dyn ConversationDirectory) -> Result<ConversationPage> {
        match directory.fetch_conversations(None).await {
            Ok(page) => {
                info!("Refetched conversation list ({} conversations)", page.conversations.len());
                self.write(&page)?;
                Ok(page)
            }
            Err(e) => {
                warn!("Failed to refetch conversation list: {}", e);
                Err(e)
            }
        }
    }
}
