//! Event builders, scripted model and toy tools shared by the unit tests

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tern_ai::{Completion, CompletionRequest, Content, Llm, Message, Usage};
use uuid::Uuid;

use crate::{
    event::{
        ActionEvent, AgentErrorEvent, CondensationEvent, Event, EventId, EventKind,
        ObservationEvent, ObservationPayload, Source,
    },
    log::EventLog,
    state::ConversationState,
    tool::{TextObservation, Tool, ToolContext},
};

// --- Events ---

pub(crate) fn event(id: u64, source: Source, kind: EventKind) -> Event {
    Event::new(EventId(id), source, kind)
}

pub(crate) fn user_message(id: u64, text: &str) -> Event {
    event(id, Source::User, EventKind::message(Message::user(text)))
}

pub(crate) fn agent_message(id: u64, text: &str) -> Event {
    event(
        id,
        Source::Agent,
        EventKind::message(Message::assistant(vec![Content::text(text)])),
    )
}

pub(crate) fn action(id: u64, response_id: &str, call_id: &str, tool: &str, args: Value) -> Event {
    event(
        id,
        Source::Agent,
        EventKind::Action(ActionEvent {
            tool_name: tool.to_string(),
            tool_call_id: call_id.to_string(),
            arguments: args.clone(),
            action: Some(args),
            llm_response_id: response_id.to_string(),
            thought: None,
            reasoning: None,
        }),
    )
}

pub(crate) fn observation(id: u64, action_id: u64, call_id: &str, tool: &str, text: &str) -> Event {
    event(
        id,
        Source::Environment,
        EventKind::Observation(ObservationEvent {
            action_id: EventId(action_id),
            tool_name: tool.to_string(),
            tool_call_id: call_id.to_string(),
            observation: ObservationPayload {
                content: vec![Content::text(text)],
                is_error: false,
                data: json!({ "text": text }),
            },
        }),
    )
}

pub(crate) fn agent_error(id: u64, call_id: &str, tool: &str, error: &str) -> Event {
    event(
        id,
        Source::Agent,
        EventKind::AgentError(AgentErrorEvent {
            tool_name: tool.to_string(),
            tool_call_id: call_id.to_string(),
            error: error.to_string(),
        }),
    )
}

pub(crate) fn condensation(
    id: u64,
    forgotten: &[u64],
    summary: Option<&str>,
    offset: Option<usize>,
) -> Event {
    event(
        id,
        Source::Environment,
        EventKind::Condensation(CondensationEvent {
            forgotten_event_ids: forgotten.iter().copied().map(EventId).collect(),
            summary: summary.map(str::to_string),
            summary_offset: offset,
            llm_response_id: None,
        }),
    )
}

pub(crate) fn condensation_request(id: u64) -> Event {
    event(id, Source::Environment, EventKind::CondensationRequest)
}

// --- Tools ---

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EchoAction {
    pub text: String,
}

/// Returns its input and counts invocations
pub(crate) struct EchoTool {
    calls: Arc<AtomicU32>,
}

impl EchoTool {
    pub(crate) fn new() -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Tool for EchoTool {
    type Action = EchoAction;
    type Observation = TextObservation;

    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes input"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, action: EchoAction, _ctx: &ToolContext) -> anyhow::Result<TextObservation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TextObservation::new(action.text))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FailAction {}

/// Always fails with an executor error
pub(crate) struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    type Action = FailAction;
    type Observation = TextObservation;

    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _action: FailAction, _ctx: &ToolContext) -> anyhow::Result<TextObservation> {
        Err(anyhow::anyhow!("disk on fire"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SleepAction {
    pub millis: u64,
}

/// Sleeps before answering, leaving room for other tasks to interleave
pub(crate) struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    type Action = SleepAction;
    type Observation = TextObservation;

    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for a while"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "millis": { "type": "integer", "minimum": 0 }
            },
            "required": ["millis"]
        })
    }

    async fn execute(&self, action: SleepAction, _ctx: &ToolContext) -> anyhow::Result<TextObservation> {
        tokio::time::sleep(std::time::Duration::from_millis(action.millis)).await;
        Ok(TextObservation::new(format!("slept {}ms", action.millis)))
    }
}

pub(crate) fn test_state() -> ConversationState {
    ConversationState::new(Uuid::new_v4(), EventLog::new(), PathBuf::from("/tmp/tern-test"))
}

pub(crate) fn test_context() -> ToolContext {
    test_state().tool_context()
}

// --- Model ---

type Script = VecDeque<tern_ai::Result<Completion>>;

/// Replays queued completions per usage id; answers "done" once a queue runs dry.
///
/// Clones and re-tagged copies share the scripts and the request record.
#[derive(Clone)]
pub(crate) struct ScriptedLlm {
    usage_id: String,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    requests: Arc<Mutex<Vec<(String, CompletionRequest)>>>,
}

impl ScriptedLlm {
    pub(crate) fn new() -> Self {
        Self {
            usage_id: "agent".to_string(),
            scripts: Arc::default(),
            requests: Arc::default(),
        }
    }

    /// Queue a response for this usage id
    pub(crate) fn push(&self, response: tern_ai::Result<Completion>) {
        self.push_for(&self.usage_id, response);
    }

    /// Queue a response for another usage id
    pub(crate) fn push_for(&self, usage_id: &str, response: tern_ai::Result<Completion>) {
        self.scripts
            .lock()
            .entry(usage_id.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every request seen under this usage id
    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests_for(&self.usage_id)
    }

    pub(crate) fn requests_for(&self, usage_id: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|(id, _)| id == usage_id)
            .map(|(_, request)| request.clone())
            .collect()
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    fn usage_id(&self) -> &str {
        &self.usage_id
    }

    fn with_usage_id(&self, usage_id: &str) -> Arc<dyn Llm> {
        Arc::new(Self {
            usage_id: usage_id.to_string(),
            scripts: self.scripts.clone(),
            requests: self.requests.clone(),
        })
    }

    async fn complete(&self, request: &CompletionRequest) -> tern_ai::Result<Completion> {
        self.requests
            .lock()
            .push((self.usage_id.clone(), request.clone()));
        let next = self
            .scripts
            .lock()
            .get_mut(&self.usage_id)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(text_completion("resp-default", "done")))
    }
}

fn test_usage() -> Usage {
    Usage {
        input: 10,
        output: 5,
        ..Default::default()
    }
}

pub(crate) fn text_completion(id: &str, text: &str) -> Completion {
    Completion {
        id: id.to_string(),
        message: Message::assistant(vec![Content::text(text)]),
        usage: test_usage(),
    }
}

/// A completion requesting `(call_id, tool, arguments)` calls
pub(crate) fn tool_completion(id: &str, calls: &[(&str, &str, Value)]) -> Completion {
    let content = calls
        .iter()
        .map(|(call_id, name, args)| Content::tool_call(*call_id, *name, args.clone()))
        .collect();
    Completion {
        id: id.to_string(),
        message: Message::assistant(content),
        usage: test_usage(),
    }
}
