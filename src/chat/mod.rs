// Chat client core for the club app
// One session per open conversation screen; the connection manager, history
// source and caches are shared through `ChatServices`

pub mod cache;
pub mod connection;
pub mod history;
pub mod message_list;
pub mod session;

pub use cache::{ConversationCache, ConversationDirectory, QueryCache, CONVERSATIONS_TAG};
pub use connection::{ConnectionManager, Subscription, Transport};
pub use history::{HistoryQuery, HistoryState, MessageHistory};
pub use message_list::{MessageList, Replaced};
pub use session::{ChatServices, ChatSession, SendOutcome, SessionEvent, SessionSettings, SessionUpdate};
