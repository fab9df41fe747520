//! Conversation state: event log, execution status, workspace and usage

use std::{path::PathBuf, sync::Arc};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tern_ai::Usage;
use uuid::Uuid;

use crate::{
    event::{Event, EventKind},
    handle::ConversationHandle,
    log::EventLog,
    secrets::SecretRegistry,
    tool::ToolContext,
};

/// Where a conversation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    /// Actions were proposed and await the user's decision
    WaitingForConfirmation,
    Paused,
    Finished,
    Error,
    /// The agent repeats itself without progress
    Stuck,
}

/// Status plus the pause marker, shared with every handle under one lock
#[derive(Debug)]
pub(crate) struct Control {
    pub(crate) status: ExecutionStatus,
    /// A pause event was appended since the last run started
    pub(crate) pause_emitted: bool,
}

/// Accumulated model usage, keyed by usage id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationStats {
    usage: IndexMap<String, Usage>,
}

impl ConversationStats {
    pub fn record(&mut self, usage_id: &str, usage: &Usage) {
        self.usage.entry(usage_id.to_string()).or_default().add(usage);
    }

    pub fn get(&self, usage_id: &str) -> Option<&Usage> {
        self.usage.get(usage_id)
    }

    /// Usage summed over every usage id
    pub fn total(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.usage.values() {
            total.add(usage);
        }
        total
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Usage)> {
        self.usage.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Everything a conversation owns besides its agent
pub struct ConversationState {
    id: Uuid,
    log: EventLog,
    control: Arc<Mutex<Control>>,
    pub confirmation_mode: bool,
    pub workspace: PathBuf,
    pub persistence_dir: Option<PathBuf>,
    pub secrets: Arc<SecretRegistry>,
    pub stats: ConversationStats,
}

impl ConversationState {
    pub fn new(id: Uuid, log: EventLog, workspace: PathBuf) -> Self {
        Self {
            id,
            log,
            control: Arc::new(Mutex::new(Control {
                status: ExecutionStatus::Idle,
                pause_emitted: false,
            })),
            confirmation_mode: false,
            workspace,
            persistence_dir: None,
            secrets: Arc::new(SecretRegistry::new()),
            stats: ConversationStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.snapshot()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.control.lock().status
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        let mut control = self.control.lock();
        if control.status != status {
            tracing::debug!(conversation = %self.id, from = ?control.status, to = ?status, "Status change");
            control.status = status;
        }
    }

    /// Cloneable handle for other threads and tools
    pub fn handle(&self) -> ConversationHandle {
        ConversationHandle::new(self.id, self.control.clone(), self.log.clone())
    }

    /// Context passed to tool resolvers and executors
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            working_dir: self.workspace.clone(),
            persistence_dir: self.persistence_dir.clone(),
            secrets: self.secrets.clone(),
            conversation: self.handle(),
        }
    }

    /// Clear the pause marker and move a resumable conversation to Running
    pub(crate) fn begin_run(&self) {
        let mut control = self.control.lock();
        control.pause_emitted = false;
        if matches!(
            control.status,
            ExecutionStatus::Idle | ExecutionStatus::Paused | ExecutionStatus::Error
        ) {
            control.status = ExecutionStatus::Running;
        }
    }

    /// Decide at the top of a loop iteration whether to keep stepping.
    ///
    /// Confirmation is granted by re-entering the loop, so a waiting
    /// conversation moves back to Running here.
    pub(crate) fn enter_iteration(&self) -> bool {
        let mut control = self.control.lock();
        match control.status {
            ExecutionStatus::Finished | ExecutionStatus::Paused | ExecutionStatus::Stuck => false,
            ExecutionStatus::WaitingForConfirmation => {
                control.status = ExecutionStatus::Running;
                true
            }
            _ => true,
        }
    }

    /// Whether the log holds a system prompt already
    pub(crate) fn has_system_prompt(&self) -> bool {
        self.log.with_events(|events| {
            events
                .iter()
                .any(|e| matches!(e.kind, EventKind::SystemPrompt { .. }))
        })
    }
}
