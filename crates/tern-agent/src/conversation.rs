//! A conversation: agent plus state, and the run loop driving them

use std::{path::PathBuf, sync::Arc};

use serde_json::Value;
use tern_ai::{BoxedLlm, Message};
use uuid::Uuid;

use crate::{
    agent::{Agent, AgentConfig, pending_actions},
    builtins::FINISH_TOOL,
    condenser::{Condenser, NoOpCondenser},
    error::{Error, Result},
    event::{Event, EventKind, Source, UserRejectEvent},
    handle::ConversationHandle,
    log::{EventLog, EventStore},
    registry::{ToolRegistry, ToolSet, ToolSpec},
    secrets::SecretValue,
    state::{ConversationState, ConversationStats, ExecutionStatus},
    stuck,
    tool::BoxedTool,
};

/// Builder for [`Conversation`]
pub struct ConversationBuilder {
    llm: BoxedLlm,
    config: AgentConfig,
    id: Option<Uuid>,
    workspace: PathBuf,
    persistence_dir: Option<PathBuf>,
    registry: Option<Arc<ToolRegistry>>,
    specs: Vec<ToolSpec>,
    tools: Vec<BoxedTool>,
    condenser: Option<Arc<dyn Condenser>>,
    confirmation_mode: Option<bool>,
    secrets: Vec<(String, SecretValue)>,
    store: Option<Arc<dyn EventStore>>,
}

impl ConversationBuilder {
    fn new(llm: BoxedLlm) -> Self {
        Self {
            llm,
            config: AgentConfig::default(),
            id: None,
            workspace: PathBuf::from("."),
            persistence_dir: None,
            registry: None,
            specs: Vec::new(),
            tools: Vec::new(),
            condenser: None,
            confirmation_mode: None,
            secrets: Vec::new(),
            store: None,
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Reuse an id, typically together with [`ConversationBuilder::store`]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn persistence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }

    /// Tools resolved from `registry` by spec
    pub fn tools(mut self, registry: Arc<ToolRegistry>, specs: Vec<ToolSpec>) -> Self {
        self.registry = Some(registry);
        self.specs = specs;
        self
    }

    /// A ready-made tool, added after the resolved ones
    pub fn tool(mut self, tool: BoxedTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn condenser(mut self, condenser: Arc<dyn Condenser>) -> Self {
        self.condenser = Some(condenser);
        self
    }

    /// Overrides [`AgentConfig::confirmation_mode`]
    pub fn confirmation_mode(mut self, enabled: bool) -> Self {
        self.confirmation_mode = Some(enabled);
        self
    }

    pub fn secret(mut self, key: impl Into<String>, value: impl Into<SecretValue>) -> Self {
        self.secrets.push((key.into(), value.into()));
        self
    }

    /// Persist events to `store`, resuming whatever it already holds
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Conversation> {
        let log = match self.store {
            Some(store) => EventLog::open(store)?,
            None => EventLog::new(),
        };
        let mut state =
            ConversationState::new(self.id.unwrap_or_else(Uuid::new_v4), log, self.workspace);
        state.persistence_dir = self.persistence_dir;
        state.confirmation_mode = self
            .confirmation_mode
            .unwrap_or(self.config.confirmation_mode);
        state.secrets.update(self.secrets);

        let mut tools = match (&self.registry, self.specs.first()) {
            (Some(registry), _) => registry.resolve_tools(&self.specs, &state.tool_context())?,
            (None, Some(spec)) => return Err(Error::UnknownToolSpec(spec.name.clone())),
            (None, None) => Vec::new(),
        };
        tools.extend(self.tools);
        let tools = ToolSet::new(tools)?;

        let condenser = self
            .condenser
            .unwrap_or_else(|| Arc::new(NoOpCondenser));
        let agent = Agent::new(self.config, self.llm, tools, condenser);

        if !state.has_system_prompt() {
            state
                .log()
                .append(Source::Agent, agent.system_prompt_event())?;
        }
        tracing::info!(
            conversation = %state.id(),
            tools = ?agent.tools().names(),
            "Conversation ready"
        );
        Ok(Conversation { state, agent })
    }
}

/// An agent bound to its state. One runner at a time; other threads use a
/// [`ConversationHandle`].
pub struct Conversation {
    state: ConversationState,
    agent: Agent,
}

impl Conversation {
    pub fn builder(llm: BoxedLlm) -> ConversationBuilder {
        ConversationBuilder::new(llm)
    }

    pub fn id(&self) -> Uuid {
        self.state.id()
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.status()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events()
    }

    pub fn stats(&self) -> &ConversationStats {
        &self.state.stats
    }

    pub fn handle(&self) -> ConversationHandle {
        self.state.handle()
    }

    /// See [`ConversationHandle::pause`]
    pub fn pause(&self) -> Result<bool> {
        self.state.handle().pause()
    }

    pub fn set_confirmation_mode(&mut self, enabled: bool) {
        self.state.confirmation_mode = enabled;
    }

    /// Append a user message. A finished or stuck conversation becomes idle again.
    pub fn send_message(&self, text: impl Into<String>) -> Result<Event> {
        let event = self
            .state
            .log()
            .append(Source::User, EventKind::message(Message::user(text)))?;
        if matches!(
            self.state.status(),
            ExecutionStatus::Finished | ExecutionStatus::Stuck
        ) {
            self.state.set_status(ExecutionStatus::Idle);
        }
        Ok(event)
    }

    /// Run a single step outside the loop
    pub async fn step(&mut self) -> Result<()> {
        self.agent.step(&mut self.state).await
    }

    /// Step until the agent finishes, pauses, waits for confirmation or gets stuck.
    ///
    /// Calling `run` while waiting for confirmation executes the pending
    /// actions. A failing step or exhausting `max_iterations` sets the status
    /// to `Error`, records a `ConversationError` event and returns the error.
    pub async fn run(&mut self) -> Result<()> {
        self.state.begin_run();
        let max_iterations = self.agent.config().max_iterations;
        let mut iterations = 0u32;

        tracing::info!(conversation = %self.id(), "Run started");
        loop {
            if !self.state.enter_iteration() {
                break;
            }
            if self.agent.config().stuck_detection && self.state.log().with_events(stuck::is_stuck)
            {
                self.state.set_status(ExecutionStatus::Stuck);
                break;
            }

            if let Err(e) = self.agent.step(&mut self.state).await {
                self.record_failure(&e);
                return Err(e);
            }
            if matches!(
                self.state.status(),
                ExecutionStatus::Finished | ExecutionStatus::WaitingForConfirmation
            ) {
                break;
            }

            iterations += 1;
            if iterations >= max_iterations {
                let e = Error::MaxIterations(max_iterations);
                self.record_failure(&e);
                return Err(e);
            }
        }
        tracing::info!(conversation = %self.id(), status = ?self.status(), iterations, "Run stopped");
        Ok(())
    }

    fn record_failure(&self, error: &Error) {
        tracing::error!(conversation = %self.id(), code = error.code(), "Run failed: {}", error);
        self.state.set_status(ExecutionStatus::Error);
        let recorded = self.state.log().append(
            Source::Environment,
            EventKind::ConversationError {
                code: error.code().to_string(),
                detail: error.to_string(),
            },
        );
        if let Err(e) = recorded {
            tracing::warn!("Failed to record conversation error: {}", e);
        }
    }

    /// Decline every pending action; returns how many were rejected
    pub fn reject_pending_actions(&self, reason: &str) -> Result<usize> {
        let pending = self.state.log().with_events(pending_actions);
        for (action_id, action) in &pending {
            self.state.log().append(
                Source::User,
                EventKind::UserReject(UserRejectEvent {
                    action_id: *action_id,
                    tool_name: action.tool_name.clone(),
                    tool_call_id: action.tool_call_id.clone(),
                    reason: reason.to_string(),
                }),
            )?;
        }
        if self.state.status() == ExecutionStatus::WaitingForConfirmation {
            self.state.set_status(ExecutionStatus::Idle);
        }
        tracing::info!(count = pending.len(), "Rejected pending actions");
        Ok(pending.len())
    }

    /// The agent's last word, see [`final_response`]
    pub fn final_response(&self) -> Option<String> {
        self.state.log().with_events(final_response)
    }
}

/// The message of the last `finish` call or the last agent message, whichever is later
pub fn final_response(events: &[Event]) -> Option<String> {
    events.iter().rev().find_map(|event| match &event.kind {
        EventKind::Action(action) if action.tool_name == FINISH_TOOL => action
            .action
            .as_ref()
            .and_then(|a| a.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string),
        EventKind::Message(message) if event.source == Source::Agent => {
            Some(message.message.text())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryEventStore;
    use crate::testing::{EchoTool, ScriptedLlm, SleepTool, text_completion, tool_completion};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn conversation(llm: &ScriptedLlm) -> (Conversation, Arc<std::sync::atomic::AtomicU32>) {
        let (echo, calls) = EchoTool::new();
        let conversation = Conversation::builder(Arc::new(llm.clone()))
            .workspace("/tmp/tern-test")
            .tool(Arc::new(echo))
            .build()
            .unwrap();
        (conversation, calls)
    }

    fn count(conversation: &Conversation, name: &str) -> usize {
        conversation
            .events()
            .iter()
            .filter(|e| e.kind_name() == name)
            .count()
    }

    #[tokio::test]
    async fn test_build_records_system_prompt_once() {
        let llm = ScriptedLlm::new();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let first = Conversation::builder(Arc::new(llm.clone()))
            .store(store.clone())
            .build()
            .unwrap();
        match &first.events()[0].kind {
            EventKind::SystemPrompt { tools, .. } => {
                assert!(tools.iter().any(|t| t.name == "finish"));
                assert!(tools.iter().any(|t| t.name == "think"));
            }
            other => panic!("expected system prompt, got {:?}", other),
        }

        let resumed = Conversation::builder(Arc::new(llm))
            .id(first.id())
            .store(store)
            .build()
            .unwrap();
        assert_eq!(count(&resumed, "system_prompt"), 1);
        assert_eq!(resumed.id(), first.id());
    }

    #[tokio::test]
    async fn test_tool_specs_without_registry_rejected() {
        let llm = ScriptedLlm::new();
        let err = Conversation::builder(Arc::new(llm))
            .tools(Arc::new(ToolRegistry::new()), vec![ToolSpec::new("shell")])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownToolSpec(name) if name == "shell"));
    }

    #[tokio::test]
    async fn test_run_to_finish() {
        let llm = ScriptedLlm::new();
        llm.push(Ok(tool_completion("r1", &[("c1", "echo", json!({"text": "hi"}))])));
        llm.push(Ok(tool_completion(
            "r2",
            &[("c2", "finish", json!({"message": "echoed hi"}))],
        )));
        let (mut conversation, calls) = conversation(&llm);
        conversation.send_message("echo hi").unwrap();

        conversation.run().await.unwrap();

        assert_eq!(conversation.status(), ExecutionStatus::Finished);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conversation.final_response().as_deref(), Some("echoed hi"));
        assert_eq!(conversation.stats().get("agent").map(|u| u.input), Some(20));
    }

    #[tokio::test]
    async fn test_finished_conversation_resumes_on_message() {
        let llm = ScriptedLlm::new();
        llm.push(Ok(text_completion("r1", "first answer")));
        llm.push(Ok(text_completion("r2", "second answer")));
        let (mut conversation, _) = conversation(&llm);

        conversation.send_message("one").unwrap();
        conversation.run().await.unwrap();
        assert_eq!(conversation.final_response().as_deref(), Some("first answer"));

        conversation.run().await.unwrap();
        assert_eq!(llm.requests().len(), 1);

        conversation.send_message("two").unwrap();
        assert_eq!(conversation.status(), ExecutionStatus::Idle);
        conversation.run().await.unwrap();
        assert_eq!(conversation.final_response().as_deref(), Some("second answer"));
    }

    #[tokio::test]
    async fn test_confirmation_then_approve() {
        let llm = ScriptedLlm::new();
        llm.push(Ok(tool_completion("r1", &[("c1", "echo", json!({"text": "x"}))])));
        let (mut conversation, calls) = conversation(&llm);
        conversation.set_confirmation_mode(true);
        conversation.send_message("echo x").unwrap();

        conversation.run().await.unwrap();
        assert_eq!(conversation.status(), ExecutionStatus::WaitingForConfirmation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Running again approves; the default scripted reply then finishes
        conversation.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conversation.status(), ExecutionStatus::Finished);
        assert_eq!(conversation.final_response().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_confirmation_then_reject() {
        let llm = ScriptedLlm::new();
        llm.push(Ok(tool_completion(
            "r1",
            &[
                ("c1", "echo", json!({"text": "x"})),
                ("c2", "echo", json!({"text": "y"})),
            ],
        )));
        let (mut conversation, calls) = conversation(&llm);
        conversation.set_confirmation_mode(true);
        conversation.send_message("echo twice").unwrap();
        conversation.run().await.unwrap();

        assert_eq!(conversation.reject_pending_actions("not now").unwrap(), 2);
        assert_eq!(conversation.status(), ExecutionStatus::Idle);
        assert_eq!(count(&conversation, "user_reject"), 2);
        assert_eq!(conversation.reject_pending_actions("again").unwrap(), 0);

        conversation.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let last_request = llm.requests().pop().unwrap();
        assert!(
            last_request
                .messages
                .iter()
                .any(|m| m.text().contains("Action rejected by the user: not now"))
        );
    }

    #[tokio::test]
    async fn test_pause_before_run_stops_immediately() {
        let llm = ScriptedLlm::new();
        let (mut conversation, _) = conversation(&llm);
        conversation.send_message("hi").unwrap();

        assert!(conversation.pause().unwrap());
        assert!(!conversation.handle().pause().unwrap());
        assert_eq!(count(&conversation, "pause"), 1);

        // run() resumes a paused conversation
        conversation.run().await.unwrap();
        assert_eq!(conversation.status(), ExecutionStatus::Finished);
        assert!(!conversation.handle().is_pause_requested());
    }

    #[tokio::test]
    async fn test_pause_from_another_task_stops_loop() {
        let llm = ScriptedLlm::new();
        for i in 0..50 {
            llm.push(Ok(tool_completion(
                &format!("r{i}"),
                &[(format!("c{i}").as_str(), "sleep", json!({"millis": 5 + i}))],
            )));
        }
        let mut conversation = Conversation::builder(Arc::new(llm.clone()))
            .tool(Arc::new(SleepTool))
            .build()
            .unwrap();
        conversation.send_message("keep going").unwrap();

        let handle = conversation.handle();
        let pauser = tokio::spawn(async move {
            loop {
                let observed = handle
                    .events()
                    .iter()
                    .filter(|e| e.kind_name() == "observation")
                    .count();
                if observed >= 2 {
                    return handle.pause().unwrap();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let runner = tokio::spawn(async move {
            conversation.run().await.unwrap();
            conversation
        });

        assert!(pauser.await.unwrap());
        let conversation = runner.await.unwrap();
        assert_eq!(conversation.status(), ExecutionStatus::Paused);
        assert!(count(&conversation, "observation") < 50);
        assert_eq!(count(&conversation, "pause"), 1);

        // The pause lands between steps, never inside a batch
        let events = conversation.events();
        let pause_at = events.iter().position(|e| e.kind_name() == "pause").unwrap();
        assert!(pending_actions(&events[..pause_at]).len() <= 1);
        assert!(pending_actions(&events).is_empty());
    }

    #[tokio::test]
    async fn test_max_iterations_is_an_error() {
        let llm = ScriptedLlm::new();
        for i in 0..5 {
            llm.push(Ok(tool_completion(
                &format!("r{i}"),
                &[(format!("c{i}").as_str(), "echo", json!({"text": format!("n{i}")}))],
            )));
        }
        let (echo, _) = EchoTool::new();
        let mut conversation = Conversation::builder(Arc::new(llm.clone()))
            .config(AgentConfig {
                max_iterations: 3,
                ..Default::default()
            })
            .tool(Arc::new(echo))
            .build()
            .unwrap();
        conversation.send_message("loop").unwrap();

        let err = conversation.run().await.unwrap_err();
        assert!(matches!(err, Error::MaxIterations(3)));
        assert_eq!(conversation.status(), ExecutionStatus::Error);
        let last = conversation.events().pop().unwrap();
        assert!(matches!(
            last.kind,
            EventKind::ConversationError { ref code, .. } if code == "MaxIterationsReached"
        ));
    }

    #[tokio::test]
    async fn test_step_error_recorded() {
        let llm = ScriptedLlm::new();
        llm.push(Err(tern_ai::Error::Auth("bad key".into())));
        let (mut conversation, _) = conversation(&llm);
        conversation.send_message("hi").unwrap();

        let err = conversation.run().await.unwrap_err();
        assert_eq!(err.code(), "LlmError");
        assert_eq!(conversation.status(), ExecutionStatus::Error);
        assert_eq!(count(&conversation, "conversation_error"), 1);
    }

    #[tokio::test]
    async fn test_stuck_loop_stops_run() {
        let llm = ScriptedLlm::new();
        for i in 0..10 {
            llm.push(Ok(tool_completion(
                &format!("r{i}"),
                &[(format!("c{i}").as_str(), "echo", json!({"text": "same"}))],
            )));
        }
        let (mut conversation, calls) = conversation(&llm);
        conversation.send_message("loop").unwrap();

        conversation.run().await.unwrap();

        assert_eq!(conversation.status(), ExecutionStatus::Stuck);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_final_response_prefers_latest() {
        use crate::testing::{action, agent_message};
        let events = vec![
            agent_message(1, "early"),
            action(2, "r1", "c1", FINISH_TOOL, json!({"message": "wrapped up"})),
        ];
        assert_eq!(final_response(&events).as_deref(), Some("wrapped up"));
        assert_eq!(final_response(&events[..1]).as_deref(), Some("early"));
        assert_eq!(final_response(&[]), None);
    }
}
