//! The completion contract consumed by the agent runtime

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Message, Result, Tool, ToolCall, Usage};

/// A single completion request: the conversation so far plus declared tools
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Conversation messages, system prompt first
    pub messages: Vec<Message>,
    /// Tools the model may call
    pub tools: Vec<Tool>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Temperature
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Create a request without tools
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Attach tool definitions
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }
}

/// A finished completion
#[derive(Debug, Clone)]
pub struct Completion {
    /// Provider response id; shared by every action produced from this response
    pub id: String,
    /// The assistant message
    pub message: Message,
    /// Token usage for this call
    pub usage: Usage,
}

impl Completion {
    /// Tool calls requested by the assistant
    pub fn tool_calls(&self) -> Vec<ToolCall<'_>> {
        self.message.tool_calls()
    }
}

/// A language model able to complete a conversation
#[async_trait]
pub trait Llm: Send + Sync {
    /// Model identifier
    fn model(&self) -> &str;

    /// Identifier under which usage is accounted
    fn usage_id(&self) -> &str;

    /// Same model and configuration, accounted under a different usage id
    fn with_usage_id(&self, usage_id: &str) -> Arc<dyn Llm>;

    /// Request a completion
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Type alias for a shared LLM
pub type BoxedLlm = Arc<dyn Llm>;
