//! Tool registry, per-conversation tool sets and call dispatch

use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    builtins::{FinishTool, ThinkTool},
    error::{Error, Result},
    tool::{BoxedTool, ToolContext},
};

/// Builds tool instances from construction parameters and conversation context
pub type ToolResolver =
    Arc<dyn Fn(&Value, &ToolContext) -> anyhow::Result<Vec<BoxedTool>> + Send + Sync>;

/// A tool requested for a conversation: registry name plus parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Maps tool names to resolvers. Constructed explicitly and passed to the
/// conversations that use it.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    resolvers: HashMap<String, ToolResolver>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver, replacing any previous one under the same name
    pub fn register<F>(&mut self, name: impl Into<String>, resolver: F)
    where
        F: Fn(&Value, &ToolContext) -> anyhow::Result<Vec<BoxedTool>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.resolvers.insert(name.clone(), Arc::new(resolver)).is_some() {
            tracing::warn!("Tool resolver '{}' replaced", name);
        }
    }

    /// Register a single ready-made tool
    pub fn register_tool(&mut self, tool: BoxedTool) {
        let name = tool.tool_name().to_string();
        self.register(name, move |_, _| Ok(vec![tool.clone()]));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve every spec into a [`ToolSet`]
    pub fn resolve(&self, specs: &[ToolSpec], ctx: &ToolContext) -> Result<ToolSet> {
        ToolSet::new(self.resolve_tools(specs, ctx)?)
    }

    /// Resolve every spec into tool instances, in spec order
    pub fn resolve_tools(&self, specs: &[ToolSpec], ctx: &ToolContext) -> Result<Vec<BoxedTool>> {
        let mut tools = Vec::new();
        for spec in specs {
            let resolver = self
                .resolvers
                .get(&spec.name)
                .ok_or_else(|| Error::UnknownToolSpec(spec.name.clone()))?;
            let resolved = resolver(&spec.params, ctx).map_err(|source| Error::ToolResolution {
                name: spec.name.clone(),
                source,
            })?;
            tracing::debug!(spec = %spec.name, count = resolved.len(), "Resolved tools");
            tools.extend(resolved);
        }
        Ok(tools)
    }
}

/// Why a proposed tool call cannot run
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    #[error("{message}")]
    InvalidArguments { tool: String, message: String },
}

/// A validated tool call, ready to execute
#[derive(Clone)]
pub struct PreparedAction {
    pub tool: BoxedTool,
    /// Typed action, re-serialized
    pub action: Value,
}

struct RegisteredTool {
    tool: BoxedTool,
    validator: Arc<jsonschema::Validator>,
}

/// The tools available to one conversation, with compiled schemas.
///
/// Always contains the built-in `finish` and `think` tools.
#[derive(Clone)]
pub struct ToolSet {
    tools: IndexMap<String, Arc<RegisteredTool>>,
}

impl ToolSet {
    /// Compile every tool's schema; an invalid schema or duplicate name is an error
    pub fn new(tools: Vec<BoxedTool>) -> Result<Self> {
        let mut set = Self {
            tools: IndexMap::new(),
        };
        for tool in tools {
            set.insert(tool)?;
        }
        for builtin in [Arc::new(FinishTool) as BoxedTool, Arc::new(ThinkTool)] {
            if !set.tools.contains_key(builtin.tool_name()) {
                set.insert(builtin)?;
            }
        }
        Ok(set)
    }

    fn insert(&mut self, tool: BoxedTool) -> Result<()> {
        let name = tool.tool_name().to_string();
        if self.tools.contains_key(&name) {
            return Err(Error::InvalidConfig(format!(
                "tool '{}' declared more than once",
                name
            )));
        }
        let schema = tool.parameters();
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| Error::InvalidToolSchema {
                tool: name.clone(),
                message: e.to_string(),
            })?;
        self.tools.insert(
            name,
            Arc::new(RegisteredTool {
                tool,
                validator: Arc::new(validator),
            }),
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.get(name).map(|t| &t.tool)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations sent to the model, in registration order
    pub fn schemas(&self) -> Vec<tern_ai::Tool> {
        self.tools.values().map(|t| t.tool.definition()).collect()
    }

    /// Look up and validate one proposed call
    pub fn prepare(
        &self,
        name: &str,
        arguments: &Value,
    ) -> std::result::Result<PreparedAction, DispatchError> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        if let Some(message) = validate_with_validator(arguments, &registered.validator) {
            return Err(DispatchError::InvalidArguments {
                tool: name.to_string(),
                message,
            });
        }

        let action = registered
            .tool
            .parse_action(arguments)
            .map_err(|e| DispatchError::InvalidArguments {
                tool: name.to_string(),
                message: format!("Tool argument validation failed:\n{}", e),
            })?;

        Ok(PreparedAction {
            tool: registered.tool.clone(),
            action,
        })
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(args: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
