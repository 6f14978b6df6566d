//! Chat session on top of the link: modes, conversations, delivery state,
//! rate limiting and typing indicators.

pub mod context;
pub mod conversation;
pub mod history;
pub mod state;

pub use context::SessionContext;
pub use conversation::{ChatMessage, ChatMode, Conversation, ConversationKey, DeliveryState, Direction};
pub use history::{ChatHistory, HttpHistory, NoHistory};
pub use state::{RateLimitStatus, SessionState};
