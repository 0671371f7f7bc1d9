//! 对话记忆：任务内的消息序列

pub mod conversation;

pub use conversation::{Conversation, Message, Role};
