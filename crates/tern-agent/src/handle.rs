//! A cloneable handle for poking a conversation from external code.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    error::Result,
    event::{Event, EventKind, Source},
    log::EventLog,
    state::{Control, ExecutionStatus},
};

/// A cloneable handle for poking a conversation from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap. Locks are taken in the
/// order control, then log.
#[derive(Clone)]
pub struct ConversationHandle {
    id: Uuid,
    control: Arc<Mutex<Control>>,
    log: EventLog,
}

impl ConversationHandle {
    pub(crate) fn new(id: Uuid, control: Arc<Mutex<Control>>, log: EventLog) -> Self {
        Self { id, control, log }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.control.lock().status
    }

    /// Whether the conversation is paused or about to pause
    pub fn is_pause_requested(&self) -> bool {
        let control = self.control.lock();
        control.status == ExecutionStatus::Paused || control.pause_emitted
    }

    /// Request a pause, taking effect before the next step.
    ///
    /// Returns `true` if this call paused the conversation. A second call
    /// before the next run is a no-op, as is pausing a conversation that is
    /// not idle or running.
    pub fn pause(&self) -> Result<bool> {
        let mut control = self.control.lock();
        if control.status == ExecutionStatus::Paused || control.pause_emitted {
            return Ok(false);
        }
        if !matches!(
            control.status,
            ExecutionStatus::Idle | ExecutionStatus::Running
        ) {
            tracing::debug!(conversation = %self.id, status = ?control.status, "Ignoring pause");
            return Ok(false);
        }
        self.log.append(Source::User, EventKind::Pause)?;
        control.status = ExecutionStatus::Paused;
        control.pause_emitted = true;
        tracing::info!(conversation = %self.id, "Conversation paused");
        Ok(true)
    }

    /// Copy of the conversation's events
    pub fn events(&self) -> Vec<Event> {
        self.log.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_with_status(status: ExecutionStatus) -> (ConversationHandle, EventLog) {
        let log = EventLog::new();
        let control = Arc::new(Mutex::new(Control {
            status,
            pause_emitted: false,
        }));
        (ConversationHandle::new(Uuid::new_v4(), control, log.clone()), log)
    }

    fn pause_events(log: &EventLog) -> usize {
        log.snapshot()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Pause))
            .count()
    }

    #[test]
    fn test_pause_three_times_emits_one_event() {
        let (handle, log) = handle_with_status(ExecutionStatus::Running);
        assert!(handle.pause().unwrap());
        assert!(!handle.pause().unwrap());
        assert!(!handle.pause().unwrap());
        assert_eq!(pause_events(&log), 1);
        assert_eq!(handle.status(), ExecutionStatus::Paused);
        assert!(handle.is_pause_requested());
    }

    #[test]
    fn test_pause_ignored_when_finished() {
        let (handle, log) = handle_with_status(ExecutionStatus::Finished);
        assert!(!handle.pause().unwrap());
        assert_eq!(pause_events(&log), 0);
        assert_eq!(handle.status(), ExecutionStatus::Finished);
    }

    #[test]
    fn test_pause_from_other_threads() {
        let (handle, log) = handle_with_status(ExecutionStatus::Idle);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || h.pause().unwrap())
            })
            .collect();
        let paused: usize = threads
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();
        assert_eq!(paused, 1);
        assert_eq!(pause_events(&log), 1);
    }
}
