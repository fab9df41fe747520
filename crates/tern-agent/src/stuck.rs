//! Detection of agents looping without progress
//!
//! Only the history after the most recent user message is inspected; a new
//! user message always gives the agent a fresh start.

use crate::event::{Event, EventKind, Source};

/// A repetitive pattern the agent is caught in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckPattern {
    /// The same action produced the same observation four times
    RepeatingActionObservation,
    /// The same action failed three times in a row
    RepeatingActionError,
    /// Three agent messages without an action or user reply
    Monologue,
    /// Two actions alternating with the same two results, three times over
    AlternatingActionObservation,
}

/// The pattern the tail of `events` matches, if any
pub fn detect(events: &[Event]) -> Option<StuckPattern> {
    let Some(last_user) = events
        .iter()
        .rposition(|e| e.source == Source::User && matches!(e.kind, EventKind::Message(_)))
    else {
        tracing::debug!("No user message in history, skipping stuck detection");
        return None;
    };
    let events = &events[last_user + 1..];
    if events.len() < 3 {
        return None;
    }

    let (actions, observations) = recent(events, 4, Event::is_observation_like);

    if repeating_action_observation(&actions, &observations) {
        tracing::warn!("Action, Observation loop detected");
        return Some(StuckPattern::RepeatingActionObservation);
    }
    if repeating_action_error(&actions, &observations) {
        tracing::warn!("Action, Error loop detected");
        return Some(StuckPattern::RepeatingActionError);
    }
    if monologue(events) {
        tracing::warn!("Agent monologue detected");
        return Some(StuckPattern::Monologue);
    }
    if events.len() >= 6 && alternating(events) {
        tracing::warn!("Alternating Action, Observation loop detected");
        return Some(StuckPattern::AlternatingActionObservation);
    }
    None
}

pub fn is_stuck(events: &[Event]) -> bool {
    detect(events).is_some()
}

/// Up to `limit` most recent actions and matching observations, newest first
fn recent(
    events: &[Event],
    limit: usize,
    is_observation: impl Fn(&Event) -> bool,
) -> (Vec<&Event>, Vec<&Event>) {
    let mut actions = Vec::new();
    let mut observations = Vec::new();
    for event in events.iter().rev() {
        if matches!(event.kind, EventKind::Action(_)) {
            if actions.len() < limit {
                actions.push(event);
            }
        } else if is_observation(event) && observations.len() < limit {
            observations.push(event);
        }
        if actions.len() >= limit && observations.len() >= limit {
            break;
        }
    }
    (actions, observations)
}

fn all_equal(events: &[&Event]) -> bool {
    events.iter().all(|e| same_content(events[0], e))
}

fn repeating_action_observation(actions: &[&Event], observations: &[&Event]) -> bool {
    actions.len() == 4 && observations.len() == 4 && all_equal(actions) && all_equal(observations)
}

fn repeating_action_error(actions: &[&Event], observations: &[&Event]) -> bool {
    if actions.len() < 3 || observations.len() < 3 {
        return false;
    }
    all_equal(&actions[..3])
        && observations[..3]
            .iter()
            .all(|e| matches!(e.kind, EventKind::AgentError(_)))
}

fn monologue(events: &[Event]) -> bool {
    let mut agent_messages = 0;
    for event in events.iter().rev() {
        match &event.kind {
            EventKind::Message(_) if event.source == Source::Agent => agent_messages += 1,
            EventKind::Message(_) => break,
            EventKind::CondensationSummary { .. } => continue,
            _ => break,
        }
    }
    agent_messages >= 3
}

fn alternating(events: &[Event]) -> bool {
    let (a, o) = recent(events, 6, |e| {
        matches!(e.kind, EventKind::Observation(_) | EventKind::AgentError(_))
    });
    if a.len() != 6 || o.len() != 6 {
        return false;
    }
    let ping_pong = |x: &[&Event]| {
        same_content(x[0], x[2])
            && same_content(x[0], x[4])
            && same_content(x[1], x[3])
            && same_content(x[1], x[5])
    };
    ping_pong(&a) && ping_pong(&o)
}

/// Equality ignoring ids, timestamps and call identifiers
fn same_content(a: &Event, b: &Event) -> bool {
    if a.source != b.source {
        return false;
    }
    match (&a.kind, &b.kind) {
        (EventKind::Action(x), EventKind::Action(y)) => {
            x.thought == y.thought && x.action == y.action && x.tool_name == y.tool_name
        }
        (EventKind::Observation(x), EventKind::Observation(y)) => {
            x.observation == y.observation && x.tool_name == y.tool_name
        }
        (EventKind::AgentError(x), EventKind::AgentError(y)) => x.error == y.error,
        (EventKind::UserReject(x), EventKind::UserReject(y)) => {
            x.reason == y.reason && x.tool_name == y.tool_name
        }
        (EventKind::Message(x), EventKind::Message(y)) => x.message == y.message,
        (x, y) => x == y,
    }
}
