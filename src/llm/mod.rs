//! LLM 层：Model Client 抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedModelClient;
pub use openai::OpenAiClient;
pub use traits::{ModelCallError, ModelClient, ModelResponse, RetryConfig, Usage};
