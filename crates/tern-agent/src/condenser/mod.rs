//! Context condensation for long conversations
//!
//! A condenser looks at the current [`View`] and either passes it through or
//! produces a [`CondensationEvent`] that forgets part of the history. The
//! agent appends the condensation and spends the step on it; the next step
//! builds a smaller view.

mod summarizing;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::Result, event::CondensationEvent, view::View};

pub use summarizing::{
    CondensationReason, EstimatingTokenCounter, LlmSummarizingCondenser, SummarizingConfig,
    TokenCounter,
};

/// Outcome of a condenser pass
#[derive(Debug, Clone, PartialEq)]
pub enum Condensed {
    /// The view is small enough; use it as is
    View(View),
    /// History must shrink first
    Condensation(CondensationEvent),
}

#[async_trait]
pub trait Condenser: Send + Sync {
    async fn condense(&self, view: View) -> Result<Condensed>;

    /// Whether an explicit condensation request will be honored
    fn handles_condensation_requests(&self) -> bool {
        false
    }
}

/// Never condenses
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCondenser;

#[async_trait]
impl Condenser for NoOpCondenser {
    async fn condense(&self, view: View) -> Result<Condensed> {
        Ok(Condensed::View(view))
    }
}

/// Runs condensers in order until one produces a condensation
pub struct PipelineCondenser {
    condensers: Vec<Arc<dyn Condenser>>,
}

impl PipelineCondenser {
    pub fn new(condensers: Vec<Arc<dyn Condenser>>) -> Self {
        Self { condensers }
    }
}

#[async_trait]
impl Condenser for PipelineCondenser {
    async fn condense(&self, view: View) -> Result<Condensed> {
        let mut view = view;
        for condenser in &self.condensers {
            match condenser.condense(view).await? {
                Condensed::View(next) => view = next,
                condensation @ Condensed::Condensation(_) => return Ok(condensation),
            }
        }
        Ok(Condensed::View(view))
    }

    fn handles_condensation_requests(&self) -> bool {
        self.condensers
            .iter()
            .any(|c| c.handles_condensation_requests())
    }
}
