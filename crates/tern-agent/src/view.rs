//! The condensation-aware projection of the event log shown to the model

use std::collections::{HashMap, HashSet};

use tern_ai::{Content, Message};
use uuid::Uuid;

use crate::event::{CondensationEvent, Event, EventId, EventKind, Source};

/// Ordered, LLM-convertible events after applying every condensation.
///
/// Rebuilt from the full log on every step and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub events: Vec<Event>,
    /// A condensation request arrived after the most recent condensation
    pub unhandled_condensation_request: bool,
    /// Condensations applied to produce this view, oldest first
    pub condensations: Vec<CondensationEvent>,
}

impl View {
    /// Build the view for a log. Pure: the same log always yields the same view.
    pub fn from_events(events: &[Event]) -> View {
        let mut forgotten: HashSet<EventId> = HashSet::new();
        let mut condensations = Vec::new();
        for event in events {
            match &event.kind {
                EventKind::Condensation(condensation) => {
                    forgotten.extend(condensation.forgotten_event_ids.iter().copied());
                    forgotten.insert(event.id);
                    condensations.push(condensation.clone());
                }
                EventKind::CondensationRequest => {
                    forgotten.insert(event.id);
                }
                _ => {}
            }
        }

        let forgotten = enforce_batch_atomicity(events, forgotten);

        let mut kept: Vec<Event> = events
            .iter()
            .filter(|e| !forgotten.contains(&e.id) && e.is_llm_convertible())
            .cloned()
            .collect();

        let latest_summary = events.iter().rev().find_map(|e| match &e.kind {
            EventKind::Condensation(CondensationEvent {
                summary: Some(summary),
                summary_offset: Some(offset),
                ..
            }) => Some((e, summary, *offset)),
            _ => None,
        });
        if let Some((condensation, summary, offset)) = latest_summary {
            let at = offset.min(kept.len());
            tracing::debug!(offset = at, "Inserting condensation summary");
            kept.insert(
                at,
                Event {
                    id: EventId::SYNTHETIC,
                    uuid: Uuid::nil(),
                    timestamp: condensation.timestamp,
                    source: Source::Environment,
                    kind: EventKind::CondensationSummary {
                        summary: summary.clone(),
                    },
                },
            );
        }

        let mut unhandled_condensation_request = false;
        for event in events.iter().rev() {
            match event.kind {
                EventKind::Condensation(_) => break,
                EventKind::CondensationRequest => {
                    unhandled_condensation_request = true;
                    break;
                }
                _ => {}
            }
        }

        View {
            events: kept,
            unhandled_condensation_request,
            condensations,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// Position of the spliced-in summary, if any
    pub fn summary_index(&self) -> Option<usize> {
        self.events
            .iter()
            .position(|e| matches!(e.kind, EventKind::CondensationSummary { .. }))
    }

    /// Text of the spliced-in summary, if any
    pub fn summary(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match &e.kind {
            EventKind::CondensationSummary { summary } => Some(summary.as_str()),
            _ => None,
        })
    }

    /// Boundaries between atomic units, sorted, always including 0 and `len`.
    ///
    /// An atomic unit is a batch of actions sharing an `llm_response_id`
    /// together with every observation-like event answering them, or any
    /// other single event. Cutting only at these indices never separates a
    /// tool call from its result.
    pub fn manipulation_indices(&self) -> Vec<usize> {
        if self.events.is_empty() {
            return vec![0];
        }

        let mut batches: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut observation_at: HashMap<&str, usize> = HashMap::new();
        for (idx, event) in self.events.iter().enumerate() {
            if let Some(action) = event.as_action() {
                batches
                    .entry(action.llm_response_id.as_str())
                    .or_default()
                    .push(idx);
            } else if let Some(call_id) = event.observed_tool_call_id() {
                observation_at.insert(call_id, idx);
            }
        }

        let mut interior = vec![false; self.events.len() + 1];
        for action_indices in batches.values() {
            let min = action_indices.iter().copied().min().unwrap_or(0);
            let mut max = action_indices.iter().copied().max().unwrap_or(0);
            for &idx in action_indices {
                if let Some(action) = self.events[idx].as_action() {
                    if let Some(&obs) = observation_at.get(action.tool_call_id.as_str()) {
                        max = max.max(obs);
                    }
                }
            }
            for flag in interior.iter_mut().take(max + 1).skip(min + 1) {
                *flag = true;
            }
        }

        (0..=self.events.len()).filter(|&i| !interior[i]).collect()
    }

    /// Smallest manipulation index `>= threshold` (`> threshold` when
    /// `strict`), or `threshold` itself when none qualifies.
    pub fn find_next_manipulation_index(&self, threshold: usize, strict: bool) -> usize {
        self.manipulation_indices()
            .into_iter()
            .find(|&idx| if strict { idx > threshold } else { idx >= threshold })
            .unwrap_or(threshold)
    }

    /// Messages to send to the model. Tool calls without a result, and
    /// results without a call, are left out.
    pub fn to_messages(&self) -> Vec<Message> {
        events_to_messages(&filter_unmatched_tool_calls(self.events.clone()))
    }
}

/// Convert events to model messages, folding each action batch into one
/// assistant message.
pub fn events_to_messages(events: &[Event]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut i = 0;
    while i < events.len() {
        match &events[i].kind {
            EventKind::SystemPrompt { system_prompt, .. } => {
                messages.push(Message::system(system_prompt.clone()));
            }
            EventKind::CondensationSummary { summary } => {
                messages.push(Message::system(summary.clone()));
            }
            EventKind::Message(m) => messages.push(m.message.clone()),
            EventKind::Action(first) => {
                let mut content = Vec::new();
                if let Some(reasoning) = &first.reasoning {
                    content.push(Content::thinking(reasoning.clone()));
                }
                if let Some(thought) = &first.thought {
                    content.push(Content::text(thought.clone()));
                }
                let mut j = i;
                while let Some(action) = events.get(j).and_then(Event::as_action) {
                    if action.llm_response_id != first.llm_response_id {
                        break;
                    }
                    content.push(Content::tool_call(
                        action.tool_call_id.clone(),
                        action.tool_name.clone(),
                        action.arguments.clone(),
                    ));
                    j += 1;
                }
                messages.push(Message::assistant(content));
                i = j;
                continue;
            }
            EventKind::Observation(o) => messages.push(Message::tool_result(
                o.tool_call_id.clone(),
                o.tool_name.clone(),
                o.observation.content.clone(),
                o.observation.is_error,
            )),
            EventKind::AgentError(e) => messages.push(Message::tool_result(
                e.tool_call_id.clone(),
                e.tool_name.clone(),
                vec![Content::text(e.error.clone())],
                true,
            )),
            EventKind::UserReject(r) => messages.push(Message::tool_result(
                r.tool_call_id.clone(),
                r.tool_name.clone(),
                vec![Content::text(format!(
                    "Action rejected by the user: {}",
                    r.reason
                ))],
                false,
            )),
            _ => {}
        }
        i += 1;
    }
    messages
}

/// If any action of a batch is removed, remove every action of that batch
fn enforce_batch_atomicity(events: &[Event], removed: HashSet<EventId>) -> HashSet<EventId> {
    let mut batches: HashMap<&str, Vec<EventId>> = HashMap::new();
    for event in events {
        if let Some(action) = event.as_action() {
            batches
                .entry(action.llm_response_id.as_str())
                .or_default()
                .push(event.id);
        }
    }

    let mut updated = removed.clone();
    for (response_id, ids) in batches {
        if ids.iter().any(|id| removed.contains(id)) {
            tracing::debug!(
                llm_response_id = response_id,
                count = ids.len(),
                "Enforcing batch atomicity"
            );
            updated.extend(ids);
        }
    }
    updated
}

/// Drop actions without a result and results without an action, keeping
/// batches whole.
fn filter_unmatched_tool_calls(events: Vec<Event>) -> Vec<Event> {
    let action_calls: HashSet<&str> = events
        .iter()
        .filter_map(|e| e.as_action().map(|a| a.tool_call_id.as_str()))
        .collect();
    let observed_calls: HashSet<&str> = events
        .iter()
        .filter_map(Event::observed_tool_call_id)
        .collect();

    let mut removed: HashSet<EventId> = HashSet::new();
    for event in &events {
        let keep = if let Some(call_id) = event.observed_tool_call_id() {
            action_calls.contains(call_id)
        } else if let Some(action) = event.as_action() {
            observed_calls.contains(action.tool_call_id.as_str())
        } else {
            true
        };
        if !keep {
            removed.insert(event.id);
        }
    }

    let removed = enforce_batch_atomicity(&events, removed);
    let removed_calls: HashSet<String> = events
        .iter()
        .filter(|e| removed.contains(&e.id))
        .filter_map(|e| e.as_action().map(|a| a.tool_call_id.clone()))
        .collect();

    events
        .into_iter()
        .filter(|e| {
            if let Some(call_id) = e.observed_tool_call_id() {
                return !removed.contains(&e.id) && !removed_calls.contains(call_id);
            }
            e.id == EventId::SYNTHETIC || !removed.contains(&e.id)
        })
        .collect()
}
