//! Sub-agent delegation
//!
//! A [`DelegationManager`] owns named sub-conversations built from a shared
//! template. Delegating runs each assigned sub-agent on its own tokio task
//! and collects every outcome, so one failing sub-agent never hides the
//! results of the others.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tern_ai::{BoxedLlm, Content};

use crate::{
    agent::AgentConfig,
    condenser::Condenser,
    conversation::Conversation,
    error::{Error, Result},
    registry::{ToolRegistry, ToolSpec},
    tool::{Observation, Tool, ToolContext},
};

/// Name of the delegation tool
pub const DELEGATE_TOOL: &str = "delegate";

/// Reply used when a sub-agent stops without saying anything
const NO_RESPONSE: &str = "No response from sub-agent";

/// Everything needed to build a sub-conversation
#[derive(Clone)]
pub struct SubAgentTemplate {
    pub agent_config: AgentConfig,
    /// Re-tagged per sub-agent so usage is accounted separately
    pub llm: BoxedLlm,
    pub registry: Option<Arc<ToolRegistry>>,
    pub tool_specs: Vec<ToolSpec>,
    pub condenser: Option<Arc<dyn Condenser>>,
    pub workspace: PathBuf,
}

impl SubAgentTemplate {
    pub fn new(agent_config: AgentConfig, llm: BoxedLlm, workspace: impl Into<PathBuf>) -> Self {
        Self {
            agent_config,
            llm,
            registry: None,
            tool_specs: Vec::new(),
            condenser: None,
            workspace: workspace.into(),
        }
    }

    pub fn with_tools(mut self, registry: Arc<ToolRegistry>, specs: Vec<ToolSpec>) -> Self {
        self.registry = Some(registry);
        self.tool_specs = specs;
        self
    }

    pub fn with_condenser(mut self, condenser: Arc<dyn Condenser>) -> Self {
        self.condenser = Some(condenser);
        self
    }

    fn build(&self, id: &str) -> Result<Conversation> {
        let mut config = self.agent_config.clone();
        config.confirmation_mode = false;
        let mut builder = Conversation::builder(self.llm.with_usage_id(&format!("sub_agent_{id}")))
            .config(config)
            .workspace(self.workspace.clone());
        if let Some(registry) = &self.registry {
            builder = builder.tools(registry.clone(), self.tool_specs.clone());
        }
        if let Some(condenser) = &self.condenser {
            builder = builder.condenser(condenser.clone());
        }
        builder.build()
    }
}

/// What one sub-agent produced for its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationOutcome {
    pub id: String,
    /// Final response, or the failure description
    pub result: std::result::Result<String, String>,
}

type SubAgent = Arc<tokio::sync::Mutex<Conversation>>;

/// Spawns and drives a bounded set of named sub-agents
pub struct DelegationManager {
    template: SubAgentTemplate,
    max_children: usize,
    sub_agents: parking_lot::Mutex<IndexMap<String, SubAgent>>,
}

impl DelegationManager {
    pub fn new(template: SubAgentTemplate, max_children: usize) -> Self {
        Self {
            template,
            max_children,
            sub_agents: parking_lot::Mutex::new(IndexMap::new()),
        }
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// Ids of the live sub-agents, in spawn order
    pub fn ids(&self) -> Vec<String> {
        self.sub_agents.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sub_agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_agents.lock().is_empty()
    }

    /// Create one sub-agent per id. Either all are created or none.
    pub fn spawn(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::Delegation(
                "at least one ID is required for spawn".into(),
            ));
        }
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(Error::Delegation(format!("duplicate sub-agent ID: {id}")));
            }
        }

        let existing = self.len();
        if existing + ids.len() > self.max_children {
            return Err(Error::Delegation(format!(
                "Cannot spawn {} agents. Already have {} agents, maximum is {}",
                ids.len(),
                existing,
                self.max_children
            )));
        }

        let mut built = Vec::with_capacity(ids.len());
        for id in ids {
            built.push((id.clone(), self.template.build(id)?));
        }

        let mut sub_agents = self.sub_agents.lock();
        if sub_agents.len() + built.len() > self.max_children {
            return Err(Error::Delegation(format!(
                "Cannot spawn {} agents. Already have {} agents, maximum is {}",
                built.len(),
                sub_agents.len(),
                self.max_children
            )));
        }
        if let Some((id, _)) = built.iter().find(|(id, _)| sub_agents.contains_key(id)) {
            return Err(Error::Delegation(format!("sub-agent {id} already exists")));
        }
        for (id, conversation) in built {
            tracing::info!(sub_agent = %id, "Spawned sub-agent");
            sub_agents.insert(id, Arc::new(tokio::sync::Mutex::new(conversation)));
        }
        Ok(())
    }

    /// Send each task to its sub-agent and run them all concurrently.
    ///
    /// Outcomes are returned in task order. Only argument problems (no tasks,
    /// unknown ids) fail the call as a whole.
    pub async fn delegate(&self, tasks: IndexMap<String, String>) -> Result<Vec<DelegationOutcome>> {
        if tasks.is_empty() {
            return Err(Error::Delegation(
                "at least one task is required for delegate".into(),
            ));
        }

        let assigned: Vec<(String, String, SubAgent)> = {
            let sub_agents = self.sub_agents.lock();
            let missing: Vec<&str> = tasks
                .keys()
                .filter(|id| !sub_agents.contains_key(*id))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                let available: Vec<&str> = sub_agents.keys().map(String::as_str).collect();
                return Err(Error::Delegation(format!(
                    "sub-agents not found: {}. Available agents: {}",
                    missing.join(", "),
                    available.join(", ")
                )));
            }
            tasks
                .into_iter()
                .filter_map(|(id, task)| {
                    let agent = sub_agents.get(&id)?.clone();
                    Some((id, task, agent))
                })
                .collect()
        };

        let handles: Vec<_> = assigned
            .into_iter()
            .map(|(id, task, agent)| {
                tracing::info!(sub_agent = %id, task = %truncate(&task, 100), "Delegating task");
                let handle = tokio::spawn(run_task(agent, task));
                (id, handle)
            })
            .collect();

        let outcomes = futures::future::join_all(handles.into_iter().map(|(id, handle)| async move {
            let result = match handle.await {
                Ok(Ok(response)) => {
                    tracing::info!(sub_agent = %id, "Sub-agent completed");
                    Ok(response)
                }
                Ok(Err(e)) => {
                    tracing::error!(sub_agent = %id, "Sub-agent failed: {}", e);
                    Err(format!("Sub-agent {id} failed: {e}"))
                }
                Err(join_error) => {
                    tracing::error!(sub_agent = %id, "Sub-agent task aborted: {}", join_error);
                    Err(format!("Sub-agent {id} failed: {join_error}"))
                }
            };
            DelegationOutcome { id, result }
        }))
        .await;

        Ok(outcomes)
    }
}

async fn run_task(agent: SubAgent, task: String) -> Result<String> {
    let mut conversation = agent.lock().await;
    conversation.send_message(task)?;
    conversation.run().await?;
    Ok(conversation
        .final_response()
        .unwrap_or_else(|| NO_RESPONSE.to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Report sent back to the delegating model
pub fn format_outcomes(outcomes: &[DelegationOutcome]) -> String {
    let errors = outcomes.iter().filter(|o| o.result.is_err()).count();
    let mut message = format!("Completed delegation of {} tasks", outcomes.len());
    if errors > 0 {
        message.push_str(&format!(" with {} errors", errors));
    }
    if !outcomes.is_empty() {
        let lines: Vec<String> = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| match &o.result {
                Ok(response) => format!("{}. Agent {}: {}", i + 1, o.id, response),
                Err(error) => format!("{}. Agent {} ERROR: {}", i + 1, o.id, error),
            })
            .collect();
        message.push_str("\n\nResults:\n");
        message.push_str(&lines.join("\n"));
    }
    message
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DelegateAction {
    /// Create sub-agents with the given ids
    Spawn { ids: Vec<String> },
    /// Assign one task per sub-agent id and wait for all of them
    Delegate { tasks: IndexMap<String, String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateObservation {
    pub command: String,
    pub message: String,
    #[serde(default)]
    pub is_error: bool,
}

impl Observation for DelegateObservation {
    fn to_llm_content(&self) -> Vec<Content> {
        vec![Content::text(self.message.clone())]
    }

    fn is_error(&self) -> bool {
        self.is_error
    }
}

/// Exposes a [`DelegationManager`] to the model
pub struct DelegateTool {
    manager: Arc<DelegationManager>,
}

impl DelegateTool {
    pub fn new(manager: Arc<DelegationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    type Action = DelegateAction;
    type Observation = DelegateObservation;

    fn name(&self) -> &str {
        DELEGATE_TOOL
    }

    fn description(&self) -> &str {
        "Delegate work to parallel sub-agents. First `spawn` sub-agents with unique ids, \
         then `delegate` a map of id to task. All delegated tasks run concurrently and \
         this tool returns once every sub-agent has finished, with each agent's result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["spawn", "delegate"],
                    "description": "`spawn` creates sub-agents, `delegate` assigns tasks to them"
                },
                "ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Sub-agent ids to create (spawn only)"
                },
                "tasks": {
                    "type": "object",
                    "additionalProperties": { "type": "string" },
                    "description": "Map of sub-agent id to task (delegate only)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        action: DelegateAction,
        _ctx: &ToolContext,
    ) -> anyhow::Result<DelegateObservation> {
        let observation = match action {
            DelegateAction::Spawn { ids } => match self.manager.spawn(&ids) {
                Ok(()) => DelegateObservation {
                    command: "spawn".into(),
                    message: format!(
                        "Successfully spawned {} sub-agents: {}",
                        ids.len(),
                        ids.join(", ")
                    ),
                    is_error: false,
                },
                Err(e) => DelegateObservation {
                    command: "spawn".into(),
                    message: format!("Error: {}", delegation_message(&e)),
                    is_error: true,
                },
            },
            DelegateAction::Delegate { tasks } => match self.manager.delegate(tasks).await {
                Ok(outcomes) => DelegateObservation {
                    command: "delegate".into(),
                    message: format_outcomes(&outcomes),
                    is_error: false,
                },
                Err(e) => DelegateObservation {
                    command: "delegate".into(),
                    message: format!("Error: {}", delegation_message(&e)),
                    is_error: true,
                },
            },
        };
        Ok(observation)
    }
}

fn delegation_message(error: &Error) -> String {
    match error {
        Error::Delegation(message) => message.clone(),
        other => other.to_string(),
    }
}
