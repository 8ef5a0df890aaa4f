//! 记忆层：有界工作记忆、会话状态文档与持久化存储

pub mod state;
pub mod store;
pub mod working;

pub use state::{ConversationState, RetentionPolicy};
pub use store::{ConversationStore, FileConversationStore, MemoryConversationStore};
pub use working::{EntryRole, MemoryEntry, WorkingMemory};
