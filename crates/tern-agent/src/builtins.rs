//! Tools every conversation carries

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tern_ai::Content;

use crate::tool::{Observation, Tool, ToolContext};

/// Name of the tool that ends a conversation
pub const FINISH_TOOL: &str = "finish";
/// Name of the tool that records a thought
pub const THINK_TOOL: &str = "think";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishAction {
    /// Final message to the user
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishObservation {
    pub message: String,
}

impl Observation for FinishObservation {
    fn to_llm_content(&self) -> Vec<Content> {
        vec![Content::text(self.message.clone())]
    }
}

/// Signals that the task is complete
pub struct FinishTool;

#[async_trait]
impl Tool for FinishTool {
    type Action = FinishAction;
    type Observation = FinishObservation;

    fn name(&self) -> &str {
        FINISH_TOOL
    }

    fn description(&self) -> &str {
        "Signals the completion of the current task or conversation. Use this tool when \
         the task is complete, or when you cannot proceed further. Include a summary of \
         what was done in the message."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Final message to send to the user"
                }
            },
            "required": ["message"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        action: FinishAction,
        _ctx: &ToolContext,
    ) -> anyhow::Result<FinishObservation> {
        Ok(FinishObservation {
            message: action.message,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkAction {
    pub thought: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkObservation {
    pub content: String,
}

impl Observation for ThinkObservation {
    fn to_llm_content(&self) -> Vec<Content> {
        vec![Content::text(self.content.clone())]
    }
}

/// Lets the model reason out loud without side effects
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    type Action = ThinkAction;
    type Observation = ThinkObservation;

    fn name(&self) -> &str {
        THINK_TOOL
    }

    fn description(&self) -> &str {
        "Use the tool to think about something. It will not obtain new information or \
         make any changes, but just log the thought. Use it when complex reasoning or \
         brainstorming is needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The thought to log"
                }
            },
            "required": ["thought"]
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        action: ThinkAction,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ThinkObservation> {
        tracing::debug!(thought = %action.thought, "Agent thought");
        Ok(ThinkObservation {
            content: "Your thought has been logged.".to_string(),
        })
    }
}
