//! Core types for LLM interactions

use serde::{Deserialize, Serialize};

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    /// Thinking/reasoning tokens
    pub thinking: u32,
}

impl Usage {
    /// Add another usage record into this one
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.thinking += other.thinking;
    }

    /// Total tokens across all buckets
    pub fn total(&self) -> u64 {
        u64::from(self.input)
            + u64::from(self.output)
            + u64::from(self.cache_read)
            + u64::from(self.cache_write)
            + u64::from(self.thinking)
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Tool use requested
    ToolUse,
    /// Error occurred
    Error,
}

/// Content types in messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content
    Text { text: String },
    /// Image content (base64 encoded)
    Image { data: String, mime_type: String },
    /// Thinking/reasoning content
    Thinking { thinking: String },
    /// Tool call request
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl Content {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content from base64 data
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create thinking content
    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    /// Create a tool call
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is a tool call
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall { .. })
    }
}

/// Message roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// System instructions (prompt or injected context such as a summary)
    System { content: Vec<Content> },
    /// User message
    User {
        content: Vec<Content>,
        #[serde(default)]
        timestamp: i64,
    },
    /// Assistant response
    Assistant {
        content: Vec<Content>,
        #[serde(flatten)]
        metadata: AssistantMetadata,
    },
    /// Tool result
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<Content>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        timestamp: i64,
    },
}

/// Metadata for assistant messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMetadata {
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Create a system message with text content
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: vec![Content::text(text)],
        }
    }

    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![Content::text(text)],
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an assistant message from content blocks
    pub fn assistant(content: Vec<Content>) -> Self {
        Self::Assistant {
            content,
            metadata: AssistantMetadata {
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Vec<Content>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            is_error,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Get the content blocks
    pub fn content(&self) -> &[Content] {
        match self {
            Self::System { content } => content,
            Self::User { content, .. } => content,
            Self::Assistant { content, .. } => content,
            Self::ToolResult { content, .. } => content,
        }
    }

    /// Extract all tool calls from an assistant message
    pub fn tool_calls(&self) -> Vec<ToolCall<'_>> {
        match self {
            Self::Assistant { content, .. } => content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(ToolCall {
                        id,
                        name,
                        arguments,
                    }),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content()
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Get combined thinking content, if any
    pub fn thinking(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content()
            .iter()
            .filter_map(|c| match c {
                Content::Thinking { thinking } => Some(thinking.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// A borrowed view of one tool call inside an assistant message
#[derive(Debug, Clone, Copy)]
pub struct ToolCall<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub arguments: &'a serde_json::Value,
}

/// Tool definition for function calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl Tool {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}
