//! Ordered fallback across several models

use std::sync::Arc;

use async_trait::async_trait;

use crate::{BoxedLlm, Completion, CompletionRequest, Error, Llm, Result};

/// Tries each configured model in declared order until one succeeds.
///
/// Only the error of the last model is returned when every candidate fails.
pub struct FallbackRouter {
    usage_id: String,
    llms: Vec<(String, BoxedLlm)>,
}

impl FallbackRouter {
    /// Create a router. The first entry is the primary model.
    pub fn new(usage_id: impl Into<String>, llms: Vec<(String, BoxedLlm)>) -> Result<Self> {
        if llms.is_empty() {
            return Err(Error::InvalidConfig(
                "fallback router needs at least one model".into(),
            ));
        }
        Ok(Self {
            usage_id: usage_id.into(),
            llms,
        })
    }

    /// Keys of the configured models, in fallback order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.llms.iter().map(|(k, _)| k.as_str())
    }
}

#[async_trait]
impl Llm for FallbackRouter {
    fn model(&self) -> &str {
        self.llms.first().map_or("", |(_, llm)| llm.model())
    }

    fn usage_id(&self) -> &str {
        &self.usage_id
    }

    fn with_usage_id(&self, usage_id: &str) -> Arc<dyn Llm> {
        Arc::new(Self {
            usage_id: usage_id.to_string(),
            llms: self
                .llms
                .iter()
                .map(|(key, llm)| (key.clone(), llm.with_usage_id(usage_id)))
                .collect(),
        })
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut last_error: Option<Error> = None;
        for (key, llm) in &self.llms {
            if let Some(e) = &last_error {
                tracing::warn!(next = %key, "Model failed, falling back: {}", e);
            }
            tracing::info!(key = %key, model = llm.model(), "Attempting completion");
            match llm.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(e) => last_error = Some(e),
            }
        }
        let error = last_error
            .unwrap_or_else(|| Error::InvalidConfig("fallback router has no models".into()));
        tracing::error!("All fallback models failed: {}", error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Content, Message};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed {
        name: &'static str,
        fail_with: Option<fn() -> Error>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Llm for Fixed {
        fn model(&self) -> &str {
            self.name
        }
        fn usage_id(&self) -> &str {
            self.name
        }
        fn with_usage_id(&self, _usage_id: &str) -> Arc<dyn Llm> {
            Arc::new(Fixed {
                name: self.name,
                fail_with: self.fail_with,
                calls: self.calls.clone(),
            })
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            Ok(Completion {
                id: format!("{}-resp", self.name),
                message: Message::assistant(vec![Content::text(self.name)]),
                usage: Default::default(),
            })
        }
    }

    fn fixed(name: &'static str, fail_with: Option<fn() -> Error>) -> (BoxedLlm, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Fixed {
                name,
                fail_with,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[test]
    fn test_empty_router_rejected() {
        assert!(FallbackRouter::new("router", vec![]).is_err());
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let (primary, p_calls) = fixed("primary", None);
        let (backup, b_calls) = fixed("backup", None);
        let router = FallbackRouter::new(
            "router",
            vec![("primary".into(), primary), ("backup".into(), backup)],
        )
        .unwrap();
        let completion = router.complete(&CompletionRequest::default()).await.unwrap();
        assert_eq!(completion.message.text(), "primary");
        assert_eq!(p_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_in_order() {
        let (primary, _) = fixed("primary", Some(|| Error::Transport("down".into())));
        let (backup, _) = fixed("backup", None);
        let router = FallbackRouter::new(
            "router",
            vec![("primary".into(), primary), ("backup".into(), backup)],
        )
        .unwrap();
        let completion = router.complete(&CompletionRequest::default()).await.unwrap();
        assert_eq!(completion.id, "backup-resp");
    }

    #[tokio::test]
    async fn test_last_error_propagates() {
        let (primary, _) = fixed("primary", Some(|| Error::Transport("down".into())));
        let (backup, _) = fixed("backup", Some(|| Error::Auth("denied".into())));
        let router = FallbackRouter::new(
            "router",
            vec![("primary".into(), primary), ("backup".into(), backup)],
        )
        .unwrap();
        let err = router.complete(&CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_every_model_tried_once_before_failing() {
        let (first, first_calls) = fixed("first", Some(|| Error::Transport("down".into())));
        let (second, second_calls) = fixed("second", Some(|| Error::Timeout(Default::default())));
        let (third, third_calls) = fixed("third", Some(|| Error::api("overloaded", "busy")));
        let router = FallbackRouter::new(
            "router",
            vec![
                ("first".into(), first),
                ("second".into(), second),
                ("third".into(), third),
            ],
        )
        .unwrap();
        let err = router.complete(&CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Api { ref message, .. } if message == "busy"));
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_failing_model_returns_its_error() {
        let (only, calls) = fixed("only", Some(|| Error::Auth("denied".into())));
        let router = FallbackRouter::new("router", vec![("only".into(), only)]).unwrap();
        let err = router.complete(&CompletionRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_usage_id_retags_router() {
        let (primary, _) = fixed("primary", None);
        let router = FallbackRouter::new("router", vec![("primary".into(), primary)]).unwrap();
        let tagged = router.with_usage_id("sub_agent_a");
        assert_eq!(tagged.usage_id(), "sub_agent_a");
        assert_eq!(tagged.model(), "primary");
        assert_eq!(router.keys().collect::<Vec<_>>(), vec!["primary"]);
    }
}
