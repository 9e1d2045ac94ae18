// Paginated message history. Pages arrive newest first and are walked
// backwards with an opaque cursor.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::HistoryPage;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub conversation_id: String,
    pub cursor: Option<String>, // Continue after the oldest message of the previous page
    pub limit: usize,
}

impl HistoryQuery {
    pub fn new(conversation_id: &str) -> Self {
        HistoryQuery {
            conversation_id: conversation_id.to_string(),
            cursor: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_cursor(mut self, cursor: &str) -> Self {
        self.cursor = Some(cursor.to_string());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
pub trait MessageHistory: Send + Sync {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<HistoryPage>;
}

/// Progress of backward pagination
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryState {
    Idle,
    Loading,
    Exhausted,
    Error(String),
}
