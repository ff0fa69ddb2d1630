pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod resolver;
pub mod retry;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod sync;
pub mod testing;

pub mod prelude {
    pub use crate::cache::{FileCache, InMemoryCache, LocalCache};
    pub use crate::conversation::{
        Conversation, CreateConversationParams, Message, MessageRole, NewMessageParams,
    };
    pub use crate::error::{ConvoError, Result, StoreError};
    pub use crate::retry::RetryPolicy;
    pub use crate::service::ConversationService;
    pub use crate::store::{ConversationStore, InMemoryStore, RemoteStore};
}
