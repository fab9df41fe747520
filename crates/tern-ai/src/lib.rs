//! tern-ai: the language-model boundary for the tern agent runtime
//!
//! This crate defines the message and content types exchanged with a model,
//! the [`Llm`] completion trait, and composable wrappers for retry with
//! backoff and ordered fallback across several models.

pub mod error;
pub mod llm;
pub mod retry;
pub mod router;
pub mod types;

pub use error::{Error, Result};
pub use llm::{BoxedLlm, Completion, CompletionRequest, Llm};
pub use retry::{RetryConfig, RetryingLlm};
pub use router::FallbackRouter;
pub use types::*;
