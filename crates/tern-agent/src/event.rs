//! Conversation events
//!
//! The event log is the single source of truth for a conversation. Every
//! variant is serialized with an internal `type` tag so that stored logs can
//! be replayed without a registry of concrete types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_ai::{Content, Message, Usage};
use uuid::Uuid;

/// Monotonic event identifier, unique within one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    /// Reserved for events synthesized while building a view; never stored.
    pub const SYNTHETIC: EventId = EventId(0);

    /// First id handed out by an empty log
    pub const FIRST: EventId = EventId(1);

    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    User,
    Agent,
    Environment,
}

/// One immutable entry of the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub uuid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Rendered system prompt and the tool schemas offered to the model
    SystemPrompt {
        system_prompt: String,
        tools: Vec<tern_ai::Tool>,
    },
    /// A chat turn
    Message(MessageEvent),
    /// One proposed tool invocation
    Action(ActionEvent),
    /// Result of executing an action
    Observation(ObservationEvent),
    /// Recoverable failure tied to a tool call (bad arguments, unknown tool)
    AgentError(AgentErrorEvent),
    /// A pending action the user declined to run
    UserReject(UserRejectEvent),
    /// Marks earlier events as forgotten
    Condensation(CondensationEvent),
    /// Asks the condenser to condense on the next step
    CondensationRequest,
    /// Summary spliced into a view; never appended to the log
    CondensationSummary { summary: String },
    /// User-initiated pause marker
    Pause,
    /// Terminal failure of a run
    ConversationError { code: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Name of the sending agent when messages are relayed between conversations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    /// Arguments exactly as proposed by the model
    pub arguments: Value,
    /// Validated arguments; `None` when the tool is unknown or validation failed
    pub action: Option<Value>,
    /// Shared by every action produced from the same completion
    pub llm_response_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Rendered result of a tool execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationPayload {
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_error: bool,
    /// The tool's typed observation, serialized
    #[serde(default)]
    pub data: Value,
}

impl ObservationPayload {
    /// Text content joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub action_id: EventId,
    pub tool_name: String,
    pub tool_call_id: String,
    pub observation: ObservationPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRejectEvent {
    pub action_id: EventId,
    pub tool_name: String,
    pub tool_call_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CondensationEvent {
    pub forgotten_event_ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// View index at which the summary is reinserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_id: Option<String>,
}

impl Event {
    /// Create an event stamped with a fresh uuid and the current time
    pub fn new(id: EventId, source: Source, kind: EventKind) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            kind,
        }
    }

    /// Whether the event can be shown to the model
    pub fn is_llm_convertible(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SystemPrompt { .. }
                | EventKind::Message(_)
                | EventKind::Action(_)
                | EventKind::Observation(_)
                | EventKind::AgentError(_)
                | EventKind::UserReject(_)
                | EventKind::CondensationSummary { .. }
        )
    }

    pub fn as_action(&self) -> Option<&ActionEvent> {
        match &self.kind {
            EventKind::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageEvent> {
        match &self.kind {
            EventKind::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Tool call answered by this event, for observations, agent errors and rejections
    pub fn observed_tool_call_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Observation(o) => Some(&o.tool_call_id),
            EventKind::AgentError(e) => Some(&e.tool_call_id),
            EventKind::UserReject(r) => Some(&r.tool_call_id),
            _ => None,
        }
    }

    /// Whether this event answers a tool call
    pub fn is_observation_like(&self) -> bool {
        self.observed_tool_call_id().is_some()
    }

    /// Short name of the variant, for logging
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::SystemPrompt { .. } => "system_prompt",
            EventKind::Message(_) => "message",
            EventKind::Action(_) => "action",
            EventKind::Observation(_) => "observation",
            EventKind::AgentError(_) => "agent_error",
            EventKind::UserReject(_) => "user_reject",
            EventKind::Condensation(_) => "condensation",
            EventKind::CondensationRequest => "condensation_request",
            EventKind::CondensationSummary { .. } => "condensation_summary",
            EventKind::Pause => "pause",
            EventKind::ConversationError { .. } => "conversation_error",
        }
    }
}

impl EventKind {
    /// A plain message without response metadata
    pub fn message(message: Message) -> Self {
        EventKind::Message(MessageEvent {
            message,
            llm_response_id: None,
            usage: None,
            sender: None,
        })
    }
}
