//! tern-agent: execution engine for a tool-calling agent
//!
//! A [`Conversation`] is an append-only [`EventLog`] plus an [`Agent`] that
//! advances it one step at a time: derive the [`View`], condense it if it is
//! too large, ask the model, then dispatch the requested tools (optionally
//! gated by user confirmation). Runs can be paused from other tasks through a
//! [`ConversationHandle`], and work can be fanned out to sub-agents through a
//! [`DelegationManager`].

pub mod agent;
pub mod builtins;
pub mod condenser;
pub mod config;
pub mod conversation;
pub mod delegate;
pub mod error;
pub mod event;
pub mod handle;
pub mod log;
pub mod registry;
pub mod secrets;
pub mod state;
pub mod stuck;
pub mod tool;
pub mod view;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentConfig};
pub use condenser::{
    Condensed, Condenser, LlmSummarizingCondenser, NoOpCondenser, PipelineCondenser,
    SummarizingConfig,
};
pub use config::EngineConfig;
pub use conversation::{Conversation, ConversationBuilder};
pub use delegate::{DelegateTool, DelegationManager, DelegationOutcome, SubAgentTemplate};
pub use error::{Error, Result};
pub use event::{Event, EventId, EventKind, Source};
pub use handle::ConversationHandle;
pub use log::{EventLog, EventStore, InMemoryEventStore};
pub use registry::{DispatchError, ToolRegistry, ToolSet, ToolSpec};
pub use secrets::{SecretRegistry, SecretValue};
pub use state::{ConversationState, ConversationStats, ExecutionStatus};
pub use stuck::StuckPattern;
pub use tool::{BoxedTool, DynTool, Observation, TextObservation, Tool, ToolContext};
pub use view::View;
