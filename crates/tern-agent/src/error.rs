//! Error types for tern-agent

use thiserror::Error;

/// Result type alias using tern-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a step or a run
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model layer
    #[error(transparent)]
    Ai(#[from] tern_ai::Error),

    /// The summarizing condenser could not produce a summary
    #[error("Condensation error: {0}")]
    Condensation(String),

    /// A tool executor failed
    #[error("Tool '{tool}' failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    /// A tool resolver failed while building the tool set
    #[error("Resolving tool '{name}' failed: {source}")]
    ToolResolution {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A tool declared a parameter schema that does not compile
    #[error("Invalid parameter schema for tool '{tool}': {message}")]
    InvalidToolSchema { tool: String, message: String },

    /// A tool spec names a tool that is not registered
    #[error("No tool registered under '{0}'")]
    UnknownToolSpec(String),

    /// The event store rejected an operation
    #[error("Event store error: {0}")]
    Store(String),

    /// The run exceeded its iteration budget
    #[error("Maximum iterations per run ({0}) reached")]
    MaxIterations(u32),

    /// Sub-agent management failed
    #[error("Delegation error: {0}")]
    Delegation(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            _ => false,
        }
    }

    /// Stable code recorded in the conversation log when a run fails
    pub fn code(&self) -> &'static str {
        match self {
            Error::Ai(_) => "LlmError",
            Error::Condensation(_) => "CondensationError",
            Error::ToolExecution { .. } => "ToolExecutionError",
            Error::ToolResolution { .. } | Error::UnknownToolSpec(_) => "ToolResolutionError",
            Error::InvalidConfig(_) | Error::InvalidToolSchema { .. } => "ConfigurationError",
            Error::Store(_) => "StoreError",
            Error::MaxIterations(_) => "MaxIterationsReached",
            Error::Delegation(_) => "DelegationError",
            Error::Json(_) => "SerializationError",
            Error::Other(_) => "InternalError",
        }
    }
}
