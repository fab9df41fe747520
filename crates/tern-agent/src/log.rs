//! Append-only event log and its persistence collaborator

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    event::{Event, EventId, EventKind, Source},
};

/// Durable storage behind an [`EventLog`]
pub trait EventStore: Send + Sync {
    /// Persist one event. Called in append order.
    fn append(&self, event: &Event) -> Result<()>;

    /// Every stored event, in append order
    fn load_all(&self) -> Result<Vec<Event>>;
}

/// Event store kept in process memory
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Event>> {
        Ok(self.events.lock().clone())
    }
}

struct LogInner {
    events: Vec<Event>,
    next_id: EventId,
    store: Arc<dyn EventStore>,
}

/// Cloneable handle to a conversation's event log.
///
/// Clones share the same log, so events can be appended from any thread.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// An empty log backed by an in-memory store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                events: Vec::new(),
                next_id: EventId::FIRST,
                store: Arc::new(InMemoryEventStore::new()),
            })),
        }
    }

    /// Replay `store` and continue numbering after the highest loaded id
    pub fn open(store: Arc<dyn EventStore>) -> Result<Self> {
        let events = store.load_all()?;
        let mut last = EventId::SYNTHETIC;
        for event in &events {
            if event.id <= last {
                return Err(Error::Store(format!(
                    "event ids out of order: {} after {}",
                    event.id, last
                )));
            }
            last = event.id;
        }
        tracing::debug!(events = events.len(), last_id = %last, "Opened event log");
        Ok(Self {
            inner: Arc::new(Mutex::new(LogInner {
                events,
                next_id: last.next(),
                store,
            })),
        })
    }

    /// Append an event, returning the stored copy.
    ///
    /// Appending a `CondensationRequest` while an earlier one is still
    /// unhandled returns that earlier request instead of adding a new one.
    pub fn append(&self, source: Source, kind: EventKind) -> Result<Event> {
        let mut inner = self.inner.lock();
        if matches!(kind, EventKind::CondensationRequest) {
            if let Some(pending) = unhandled_request(&inner.events) {
                tracing::debug!(id = %pending.id, "Condensation already requested");
                return Ok(pending.clone());
            }
        }
        let event = Event::new(inner.next_id, source, kind);
        inner.store.append(&event)?;
        inner.next_id = inner.next_id.next();
        tracing::trace!(id = %event.id, kind = event.kind_name(), "Appended event");
        inner.events.push(event.clone());
        Ok(event)
    }

    /// Copy of every event, in order
    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    /// Run `f` against the events without copying them
    pub fn with_events<R>(&self, f: impl FnOnce(&[Event]) -> R) -> R {
        f(&self.inner.lock().events)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.inner.lock().events.last().map(|e| e.id)
    }
}

/// The tail request not yet followed by a condensation, if any
fn unhandled_request(events: &[Event]) -> Option<&Event> {
    for event in events.iter().rev() {
        match event.kind {
            EventKind::Condensation(_) => return None,
            EventKind::CondensationRequest => return Some(event),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CondensationEvent;
    use tern_ai::Message;

    #[test]
    fn test_ids_increase_from_one() {
        let log = EventLog::new();
        let a = log
            .append(Source::User, EventKind::message(Message::user("a")))
            .unwrap();
        let b = log.append(Source::User, EventKind::Pause).unwrap();
        assert_eq!(a.id, EventId(1));
        assert_eq!(b.id, EventId(2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_id(), Some(EventId(2)));
    }

    #[test]
    fn test_open_resumes_numbering() {
        let store = Arc::new(InMemoryEventStore::new());
        {
            let log = EventLog::open(store.clone()).unwrap();
            log.append(Source::User, EventKind::message(Message::user("hi")))
                .unwrap();
            log.append(Source::User, EventKind::Pause).unwrap();
        }
        let reopened = EventLog::open(store).unwrap();
        assert_eq!(reopened.len(), 2);
        let next = reopened.append(Source::User, EventKind::Pause).unwrap();
        assert_eq!(next.id, EventId(3));
    }

    #[test]
    fn test_second_unhandled_request_is_noop() {
        let log = EventLog::new();
        let first = log
            .append(Source::User, EventKind::CondensationRequest)
            .unwrap();
        let second = log
            .append(Source::User, EventKind::CondensationRequest)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(log.len(), 1);

        log.append(
            Source::Environment,
            EventKind::Condensation(CondensationEvent::default()),
        )
        .unwrap();
        let third = log
            .append(Source::User, EventKind::CondensationRequest)
            .unwrap();
        assert_eq!(third.id, EventId(3));
    }

    struct FailingStore;

    impl EventStore for FailingStore {
        fn append(&self, _event: &Event) -> Result<()> {
            Err(Error::Store("disk full".into()))
        }
        fn load_all(&self) -> Result<Vec<Event>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_store_failure_does_not_consume_id() {
        let log = EventLog::open(Arc::new(FailingStore)).unwrap();
        assert!(log.append(Source::User, EventKind::Pause).is_err());
        assert!(log.is_empty());
    }
}
