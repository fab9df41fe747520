//! Agent configuration and the single-step state machine

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tern_ai::{BoxedLlm, Completion, CompletionRequest, Content};

use crate::{
    builtins::FINISH_TOOL,
    condenser::{Condensed, Condenser},
    error::{Error, Result},
    event::{
        ActionEvent, AgentErrorEvent, Event, EventId, EventKind, MessageEvent, ObservationEvent,
        ObservationPayload, Source,
    },
    registry::{DispatchError, ToolSet},
    secrets::SecretRegistry,
    state::{ConversationState, ExecutionStatus},
    view::View,
};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous agent that completes tasks by calling the tools available to you. \
Work step by step, check the results of each tool call, and call the `finish` tool with a \
short summary once the task is complete.";

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt
    pub system_prompt: String,
    /// Steps allowed per call to `run`
    pub max_iterations: u32,
    /// Stop runs that loop without progress
    pub stuck_detection: bool,
    /// Require confirmation before executing proposed actions
    pub confirmation_mode: bool,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Temperature
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: 500,
            stuck_detection: true,
            confirmation_mode: false,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// The stateless half of a conversation: model, tools and condenser.
///
/// Everything that changes lives in [`ConversationState`], so one agent can
/// be stepped against any state built for it.
pub struct Agent {
    config: AgentConfig,
    llm: BoxedLlm,
    tools: ToolSet,
    condenser: Arc<dyn Condenser>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        llm: BoxedLlm,
        tools: ToolSet,
        condenser: Arc<dyn Condenser>,
    ) -> Self {
        Self {
            config,
            llm,
            tools,
            condenser,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn llm(&self) -> &BoxedLlm {
        &self.llm
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn condenser(&self) -> &Arc<dyn Condenser> {
        &self.condenser
    }

    /// The event recorded once at the start of every conversation
    pub fn system_prompt_event(&self) -> EventKind {
        EventKind::SystemPrompt {
            system_prompt: self.config.system_prompt.clone(),
            tools: self.tools.schemas(),
        }
    }

    /// Advance the conversation by one step.
    ///
    /// A step does exactly one of: execute confirmed actions, append a
    /// condensation, request condensation after a context overflow, or ask
    /// the model for its next move and act on it.
    pub async fn step(&self, state: &mut ConversationState) -> Result<()> {
        let events = state.events();

        let pending = pending_actions(&events);
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Executing confirmed actions");
            return self.execute_actions(state, pending).await;
        }

        let view = match self.condenser.condense(View::from_events(&events)).await? {
            Condensed::View(view) => view,
            Condensed::Condensation(condensation) => {
                tracing::info!(
                    forgotten = condensation.forgotten_event_ids.len(),
                    summarized = condensation.summary.is_some(),
                    "Appending condensation"
                );
                state
                    .log()
                    .append(Source::Environment, EventKind::Condensation(condensation))?;
                return Ok(());
            }
        };

        let request = CompletionRequest {
            messages: view.to_messages(),
            tools: self.tools.schemas(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let completion = match self.llm.complete(&request).await {
            Ok(completion) => completion,
            Err(e) if e.is_context_overflow() && self.condenser.handles_condensation_requests() => {
                tracing::warn!(error = %e, "Context window exceeded, requesting condensation");
                state
                    .log()
                    .append(Source::Environment, EventKind::CondensationRequest)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        state.stats.record(self.llm.usage_id(), &completion.usage);

        if completion.tool_calls().is_empty() {
            tracing::debug!(response = %completion.id, "Model replied without tool calls");
            state.log().append(
                Source::Agent,
                EventKind::Message(MessageEvent {
                    message: completion.message.clone(),
                    llm_response_id: Some(completion.id.clone()),
                    usage: Some(completion.usage.clone()),
                    sender: None,
                }),
            )?;
            state.set_status(ExecutionStatus::Finished);
            return Ok(());
        }

        self.handle_tool_calls(state, &completion).await
    }

    /// Record every proposed call, then run the valid ones unless confirmation is needed
    async fn handle_tool_calls(
        &self,
        state: &mut ConversationState,
        completion: &Completion,
    ) -> Result<()> {
        let thought = Some(completion.message.text()).filter(|t| !t.trim().is_empty());
        let reasoning = completion.message.thinking();

        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        for (i, call) in completion.tool_calls().into_iter().enumerate() {
            let prepared = self.tools.prepare(call.name, call.arguments);
            let action = ActionEvent {
                tool_name: call.name.to_string(),
                tool_call_id: call.id.to_string(),
                arguments: call.arguments.clone(),
                action: prepared.as_ref().ok().map(|p| p.action.clone()),
                llm_response_id: completion.id.clone(),
                thought: if i == 0 { thought.clone() } else { None },
                reasoning: if i == 0 { reasoning.clone() } else { None },
            };
            let event = state
                .log()
                .append(Source::Agent, EventKind::Action(action.clone()))?;
            match prepared {
                Ok(_) => valid.push((event.id, action)),
                Err(error) => rejected.push((action, error)),
            }
        }

        let mut unknown_tool = false;
        for (action, error) in rejected {
            let error = match error {
                DispatchError::UnknownTool(_) => {
                    unknown_tool = true;
                    format!("{}. Available tools: {}", error, self.tools.names().join(", "))
                }
                DispatchError::InvalidArguments { .. } => error.to_string(),
            };
            tracing::warn!(tool = %action.tool_name, call = %action.tool_call_id, "Rejected tool call: {}", error);
            state.log().append(
                Source::Agent,
                EventKind::AgentError(AgentErrorEvent {
                    tool_name: action.tool_name,
                    tool_call_id: action.tool_call_id,
                    error,
                }),
            )?;
        }

        if valid.is_empty() {
            if unknown_tool {
                state.set_status(ExecutionStatus::Finished);
            }
            return Ok(());
        }

        if state.confirmation_mode && requires_confirmation(&valid) {
            tracing::info!(count = valid.len(), "Waiting for confirmation");
            state.set_status(ExecutionStatus::WaitingForConfirmation);
            return Ok(());
        }

        self.execute_actions(state, valid).await?;
        if unknown_tool {
            state.set_status(ExecutionStatus::Finished);
        }
        Ok(())
    }

    /// Execute validated actions in order, appending one observation each
    async fn execute_actions(
        &self,
        state: &mut ConversationState,
        actions: Vec<(EventId, ActionEvent)>,
    ) -> Result<()> {
        let ctx = state.tool_context();
        let mut finished = false;

        for (action_id, action) in actions {
            let Some(arguments) = action.action else {
                continue;
            };
            let Some(tool) = self.tools.get(&action.tool_name) else {
                state.log().append(
                    Source::Agent,
                    EventKind::AgentError(AgentErrorEvent {
                        error: format!("Tool '{}' not found", action.tool_name),
                        tool_name: action.tool_name,
                        tool_call_id: action.tool_call_id,
                    }),
                )?;
                continue;
            };

            tracing::debug!(tool = %action.tool_name, call = %action.tool_call_id, "Executing tool");
            let mut observation = tool.execute_json(arguments, &ctx).await.map_err(|source| {
                Error::ToolExecution {
                    tool: action.tool_name.clone(),
                    source,
                }
            })?;
            mask_secrets(&state.secrets, &mut observation);

            finished |= action.tool_name == FINISH_TOOL;
            state.log().append(
                Source::Environment,
                EventKind::Observation(ObservationEvent {
                    action_id,
                    tool_name: action.tool_name,
                    tool_call_id: action.tool_call_id,
                    observation,
                }),
            )?;
        }

        if finished {
            state.set_status(ExecutionStatus::Finished);
        }
        Ok(())
    }
}

/// Validated actions with no observation, rejection or error yet
pub(crate) fn pending_actions(events: &[Event]) -> Vec<(EventId, ActionEvent)> {
    let answered: HashSet<&str> = events
        .iter()
        .filter_map(Event::observed_tool_call_id)
        .collect();
    events
        .iter()
        .filter_map(|e| e.as_action().map(|a| (e.id, a)))
        .filter(|(_, a)| a.action.is_some() && !answered.contains(a.tool_call_id.as_str()))
        .map(|(id, a)| (id, a.clone()))
        .collect()
}

/// A lone `finish` never waits for the user
fn requires_confirmation(actions: &[(EventId, ActionEvent)]) -> bool {
    match actions {
        [(_, only)] => only.tool_name != FINISH_TOOL,
        _ => true,
    }
}

fn mask_secrets(secrets: &SecretRegistry, observation: &mut ObservationPayload) {
    if secrets.is_empty() {
        return;
    }
    for content in &mut observation.content {
        if let Content::Text { text } = content {
            *text = secrets.mask(text);
        }
    }
}
