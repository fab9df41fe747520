//! Rolling condenser that replaces the middle of the history with an LLM summary

use std::{collections::BTreeSet, ops::Range, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tern_ai::{BoxedLlm, CompletionRequest, Content, Message};

use super::{Condensed, Condenser};
use crate::{
    error::{Error, Result},
    event::{CondensationEvent, Event, EventId},
    view::{View, events_to_messages},
};

/// Why a view must be condensed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondensationReason {
    /// An explicit condensation request is unhandled
    Request,
    /// The view exceeds the token budget
    Tokens,
    /// The view holds more than `max_size` events
    Events,
}

/// Counts tokens for a sequence of messages
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message]) -> usize;
}

/// chars/4 heuristic; images count as a flat 1200 tokens
#[derive(Debug, Default, Clone, Copy)]
pub struct EstimatingTokenCounter;

impl TokenCounter for EstimatingTokenCounter {
    fn count(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| content_char_count(m.content()) / 4)
            .sum()
    }
}

fn content_char_count(content: &[Content]) -> usize {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => text.len(),
            Content::Thinking { thinking } => thinking.len(),
            Content::ToolCall {
                name, arguments, ..
            } => name.len() + arguments.to_string().len(),
            Content::Image { .. } => 4800,
        })
        .sum()
}

/// Limits for [`LlmSummarizingCondenser`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizingConfig {
    /// Condense once the view holds more events than this
    pub max_size: usize,
    /// Events at the head of the view that are never forgotten
    pub keep_first: usize,
    /// Condense once the view exceeds this many tokens
    pub max_tokens: Option<usize>,
}

impl Default for SummarizingConfig {
    fn default() -> Self {
        Self {
            max_size: 120,
            keep_first: 4,
            max_tokens: None,
        }
    }
}

impl SummarizingConfig {
    /// `keep_first` must leave room for at least one condensed event
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig(
                "condenser max_size must be positive".into(),
            ));
        }
        if self.keep_first >= (self.max_size / 2).saturating_sub(1) {
            return Err(Error::InvalidConfig(format!(
                "condenser keep_first ({}) must be less than max_size / 2 - 1 ({})",
                self.keep_first,
                (self.max_size / 2).saturating_sub(1)
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(Error::InvalidConfig(
                "condenser max_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of part of an agent's working history. This summary will replace \
the original events in the agent's context, so it must capture all essential information \
needed to continue the task effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Please provide a detailed summary of the events below. The summary should cover:

1. **Goal**: What is the user's primary objective?
2. **Progress**: What has been accomplished so far? List specific actions and their results.
3. **Key Decisions**: What important decisions were made and why?
4. **Pending Work**: What remains to be done?
5. **Critical Context**: Any constraints, preferences, identifiers or values that would be lost.

Format your response as a structured summary using the headers above. Be thorough but concise.

<events>
{events}
</events>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is an existing summary of an earlier portion of this history, followed by \
events that occurred after that summary. Please create an updated, comprehensive \
summary that integrates both.

<previous-summary>
{previous_summary}
</previous-summary>

The updated summary should cover:

1. **Goal**: What is the user's primary objective? (update if it has evolved)
2. **Progress**: What has been accomplished so far? Include both previous and new progress.
3. **Key Decisions**: What important decisions were made and why?
4. **Pending Work**: What remains to be done?
5. **Critical Context**: Any constraints, preferences, identifiers or values.

<new-events>
{events}
</new-events>";

/// Maximum characters of a single tool result rendered into the prompt
const MAX_RESULT_CHARS: usize = 2000;

/// Keeps the head and a recent tail of the view and summarizes the middle.
pub struct LlmSummarizingCondenser {
    llm: BoxedLlm,
    config: SummarizingConfig,
    counter: Arc<dyn TokenCounter>,
}

impl LlmSummarizingCondenser {
    /// Create a condenser; rejects configurations that leave nothing to condense
    pub fn new(llm: BoxedLlm, config: SummarizingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            llm,
            config,
            counter: Arc::new(EstimatingTokenCounter),
        })
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &SummarizingConfig {
        &self.config
    }

    /// Every reason the view must be condensed; empty when it fits
    pub fn reasons(&self, view: &View) -> BTreeSet<CondensationReason> {
        let mut reasons = BTreeSet::new();
        if view.unhandled_condensation_request {
            reasons.insert(CondensationReason::Request);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            if self.counter.count(&view.to_messages()) > max_tokens {
                reasons.insert(CondensationReason::Tokens);
            }
        }
        if view.len() > self.config.max_size {
            reasons.insert(CondensationReason::Events);
        }
        reasons
    }

    /// Events to keep from the tail: the strictest of the active reasons
    fn kept_tail(&self, view: &View, reasons: &BTreeSet<CondensationReason>) -> usize {
        let head = self.config.keep_first.min(view.len());
        reasons
            .iter()
            .map(|reason| match reason {
                CondensationReason::Request => (view.len() / 2).saturating_sub(head + 1),
                CondensationReason::Events => (self.config.max_size / 2).saturating_sub(head + 1),
                CondensationReason::Tokens => self.tokens_tail(view, head),
            })
            .min()
            .unwrap_or(view.len())
    }

    /// Longest suffix that, together with the head, fits in half the token budget
    fn tokens_tail(&self, view: &View, head: usize) -> usize {
        let budget = self.config.max_tokens.unwrap_or(usize::MAX) / 2;
        let mut used: usize = view.events[..head]
            .iter()
            .map(|e| self.event_tokens(e))
            .sum();
        let mut tail = 0;
        for event in view.events[head..].iter().rev() {
            let tokens = self.event_tokens(event);
            if used + tokens > budget {
                break;
            }
            used += tokens;
            tail += 1;
        }
        tail
    }

    fn event_tokens(&self, event: &Event) -> usize {
        self.counter
            .count(&events_to_messages(std::slice::from_ref(event)))
    }

    /// View indices to forget, snapped to manipulation boundaries
    pub fn forgetting_range(
        &self,
        view: &View,
        reasons: &BTreeSet<CondensationReason>,
    ) -> Range<usize> {
        let head = self.config.keep_first.min(view.len());
        let tail = self.kept_tail(view, reasons);
        let start = view.find_next_manipulation_index(head, false);
        let naive_end = view.len().saturating_sub(tail);
        let end = view.find_next_manipulation_index(naive_end, false);
        if end <= start {
            return start..start;
        }
        start..end
    }

    async fn summarize(&self, forgotten: &[Event], previous: Option<&str>) -> Result<(String, String)> {
        let rendered = serialize_messages_for_summary(&events_to_messages(forgotten));
        let prompt = match previous {
            Some(previous_summary) => UPDATE_SUMMARIZATION_PROMPT
                .replace("{previous_summary}", previous_summary)
                .replace("{events}", &rendered),
            None => SUMMARIZATION_PROMPT.replace("{events}", &rendered),
        };

        let request = CompletionRequest {
            messages: vec![
                Message::system(SUMMARIZATION_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
            tools: vec![],
            max_tokens: Some(4096),
            temperature: None,
        };
        let completion = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| Error::Condensation(format!("Summarization call failed: {}", e)))?;

        let summary = completion.message.text();
        if summary.trim().is_empty() {
            return Err(Error::Condensation(
                "Summarizing model returned an empty response".into(),
            ));
        }
        Ok((summary, completion.id))
    }
}

#[async_trait]
impl Condenser for LlmSummarizingCondenser {
    async fn condense(&self, view: View) -> Result<Condensed> {
        let reasons = self.reasons(&view);
        if reasons.is_empty() {
            return Ok(Condensed::View(view));
        }

        let range = self.forgetting_range(&view, &reasons);
        if range.is_empty() {
            if reasons.contains(&CondensationReason::Request) {
                tracing::info!("Nothing to forget; marking condensation request handled");
                return Ok(Condensed::Condensation(CondensationEvent::default()));
            }
            tracing::debug!(?reasons, "Condensation needed but no safe range to forget");
            return Ok(Condensed::View(view));
        }

        let forgotten: Vec<Event> = view.events[range.clone()]
            .iter()
            .filter(|e| e.id != EventId::SYNTHETIC)
            .cloned()
            .collect();
        tracing::info!(
            ?reasons,
            start = range.start,
            end = range.end,
            view_len = view.len(),
            "Condensing view"
        );

        let (summary, response_id) = self.summarize(&forgotten, view.summary()).await?;

        Ok(Condensed::Condensation(CondensationEvent {
            forgotten_event_ids: forgotten.iter().map(|e| e.id).collect(),
            summary: Some(summary),
            summary_offset: Some(range.start),
            llm_response_id: Some(response_id),
        }))
    }

    fn handles_condensation_requests(&self) -> bool {
        true
    }
}

// --- Message Serialization ---

/// Serialize messages to plain text for the summarization prompt.
/// Uses a human-readable format to prevent the LLM from trying to "continue" the conversation.
fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg {
            Message::System { content } => {
                let text = content_to_text(content);
                if !text.is_empty() {
                    out.push_str("[System]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            Message::User { content, .. } => {
                let text = content_to_text(content);
                if !text.is_empty() {
                    out.push_str("[User]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            Message::Assistant { content, .. } => {
                let mut thinking_parts = Vec::new();
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();

                for c in content {
                    match c {
                        Content::Thinking { thinking } => thinking_parts.push(thinking.as_str()),
                        Content::Text { text } => text_parts.push(text.as_str()),
                        Content::ToolCall {
                            name, arguments, ..
                        } => tool_calls.push(format!("{}({})", name, format_tool_args(arguments))),
                        Content::Image { .. } => {}
                    }
                }

                if !thinking_parts.is_empty() {
                    out.push_str("[Assistant thinking]: ");
                    out.push_str(&thinking_parts.join(" "));
                    out.push('\n');
                }
                if !text_parts.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(&text_parts.join(""));
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&tool_calls.join("; "));
                    out.push('\n');
                }
            }
            Message::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => {
                let text = content_to_text(content);
                let label = if *is_error {
                    format!("[Tool error ({})]: ", tool_name)
                } else {
                    format!("[Tool result ({})]: ", tool_name)
                };
                out.push_str(&label);
                out.push_str(truncate_chars(&text, MAX_RESULT_CHARS));
                if text.chars().count() > MAX_RESULT_CHARS {
                    out.push_str("...(truncated)");
                }
                out.push('\n');
            }
        }
    }

    out
}

fn content_to_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            Content::Image { .. } => Some("[image]"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => {
                        format!("\"{}\"", truncate_with_ellipsis(s, 100))
                    }
                    other => truncate_with_ellipsis(&other.to_string(), 100),
                };
                format!("{}={}", k, val)
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => args.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    let cut = truncate_chars(s, max);
    if cut.len() < s.len() {
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
