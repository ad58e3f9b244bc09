//! 记忆层：短期观察、工作记忆、对话日志、模式记忆与持久化

pub mod conversation;
pub mod item;
pub mod manager;
pub mod persistence;
pub mod tokenizer;
pub mod working;

pub use conversation::{ConversationMemory, Message, Role};
pub use item::{relevance_score, MemoryItem, MemoryKind};
pub use manager::{MemoryManager, MemoryStats, AUTO_DERIVED_TAG};
pub use persistence::{MemoryError, PatternRecord, PatternStore};
pub use tokenizer::tokenize_to_tags;
pub use working::WorkingKey;
