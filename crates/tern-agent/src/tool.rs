//! Tool traits and execution context

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tern_ai::Content;

use crate::{event::ObservationPayload, handle::ConversationHandle, secrets::SecretRegistry};

/// Typed result of a tool execution
pub trait Observation: Serialize + Send + Sync + 'static {
    /// Content shown to the model
    fn to_llm_content(&self) -> Vec<Content>;

    /// Whether the tool reports a failure the model should react to
    fn is_error(&self) -> bool {
        false
    }
}

/// Read-only context handed to resolvers and executors
#[derive(Clone)]
pub struct ToolContext {
    /// Workspace the conversation operates in
    pub working_dir: PathBuf,
    /// Where the conversation persists its state, if anywhere
    pub persistence_dir: Option<PathBuf>,
    pub secrets: Arc<SecretRegistry>,
    /// The calling conversation
    pub conversation: ConversationHandle,
}

/// An executable tool with a typed action and observation
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Arguments, deserialized from the model's JSON after schema validation
    type Action: DeserializeOwned + Serialize + Send + Sync + 'static;
    type Observation: Observation;

    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for the action
    fn parameters_schema(&self) -> Value;

    /// Whether the tool only reads state
    fn read_only(&self) -> bool {
        false
    }

    /// Execute the tool
    async fn execute(
        &self,
        action: Self::Action,
        ctx: &ToolContext,
    ) -> anyhow::Result<Self::Observation>;
}

/// Object-safe form of [`Tool`], implemented for every tool
#[async_trait]
pub trait DynTool: Send + Sync {
    fn tool_name(&self) -> &str;

    fn is_read_only(&self) -> bool;

    fn parameters(&self) -> Value;

    /// Declaration sent to the model
    fn definition(&self) -> tern_ai::Tool;

    /// Deserialize arguments into the typed action and re-serialize it
    fn parse_action(&self, arguments: &Value) -> Result<Value, String>;

    /// Execute a previously parsed action
    async fn execute_json(&self, action: Value, ctx: &ToolContext)
    -> anyhow::Result<ObservationPayload>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn tool_name(&self) -> &str {
        Tool::name(self)
    }

    fn is_read_only(&self) -> bool {
        Tool::read_only(self)
    }

    fn parameters(&self) -> Value {
        Tool::parameters_schema(self)
    }

    fn definition(&self) -> tern_ai::Tool {
        tern_ai::Tool::new(
            Tool::name(self),
            Tool::description(self),
            Tool::parameters_schema(self),
        )
    }

    fn parse_action(&self, arguments: &Value) -> Result<Value, String> {
        let action: T::Action =
            serde_json::from_value(arguments.clone()).map_err(|e| e.to_string())?;
        serde_json::to_value(&action).map_err(|e| e.to_string())
    }

    async fn execute_json(
        &self,
        action: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ObservationPayload> {
        let action: T::Action = serde_json::from_value(action)?;
        let observation = self.execute(action, ctx).await?;
        Ok(ObservationPayload {
            content: observation.to_llm_content(),
            is_error: observation.is_error(),
            data: serde_json::to_value(&observation)?,
        })
    }
}

/// Type alias for a shared, type-erased tool
pub type BoxedTool = Arc<dyn DynTool>;

/// Observation carrying plain text
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct TextObservation {
    pub text: String,
    #[serde(default)]
    pub is_error: bool,
}

impl TextObservation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

impl Observation for TextObservation {
    fn to_llm_content(&self) -> Vec<Content> {
        vec![Content::text(self.text.clone())]
    }

    fn is_error(&self) -> bool {
        self.is_error
    }
}
