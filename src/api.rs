//! REST client for the club API: message history pages and the
//! conversation list.

use async_trait::async_trait;
use log::debug;
use reqwest::Url;

use crate::chat::cache::ConversationDirectory;
use crate::chat::history::{HistoryQuery, MessageHistory};
use crate::error::{ChatError, Result};
use crate::models::{ConversationPage, HistoryPage};

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ChatError::Config(format!("Invalid API base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Config(format!("API base URL {} cannot hold paths", base_url)));
        }

        Ok(HttpApi {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    /// Base URL with `segments` appended, each one percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub fn messages_url(&self, conversation_id: &str) -> Url {
        self.endpoint(&["conversations", conversation_id, "messages"])
    }

    pub fn conversations_url(&self) -> Url {
        self.endpoint(&["conversations"])
    }
}

#[async_trait]
impl MessageHistory for HttpApi {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let url = self.messages_url(&query.conversation_id);
        debug!("GET {} (cursor {:?}, limit {})", url, query.cursor, query.limit);

        let mut request = self.client.get(url).query(&[("limit", query.limit.to_string())]);
        if let Some(cursor) = &query.cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::History(format!("Server returned {}", resp.status())));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ConversationDirectory for HttpApi {
    async fn fetch_conversations(&self, cursor: Option<&str>) -> Result<ConversationPage> {
        let url = self.conversations_url();
        debug!("GET {} (cursor {:?})", url, cursor);

        let mut request = self.client.get(url);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let resp = request.send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let api = HttpApi::new("https://club.example.com/api/").unwrap();
        assert_eq!(
            api.messages_url("u14").as_str(),
            "https://club.example.com/api/conversations/u14/messages"
        );
        assert_eq!(api.conversations_url().as_str(), "https://club.example.com/api/conversations");
    }

    #[test]
    fn test_conversation_id_is_encoded_as_one_segment() {
        let api = HttpApi::new("https://club.example.com/api").unwrap();
        assert_eq!(
            api.messages_url("u14/../admin?x=1").as_str(),
            "https://club.example.com/api/conversations/u14%2F..%2Fadmin%3Fx=1/messages"
        );
    }

    #[test]
    fn test_invalid_base_url_is_a_config_error() {
        assert!(matches!(HttpApi::new("not a url"), Err(ChatError::Config(_))));
        assert!(matches!(HttpApi::new("mailto:coach@example.com"), Err(ChatError::Config(_))));
    }
}
