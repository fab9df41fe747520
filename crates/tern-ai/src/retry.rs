//! Retry with exponential backoff and per-call timeouts

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BoxedLlm, Completion, CompletionRequest, Error, Llm, Result};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Wraps an [`Llm`], retrying retryable failures and bounding each attempt by a timeout.
pub struct RetryingLlm {
    inner: BoxedLlm,
    config: RetryConfig,
    timeout: Option<Duration>,
}

impl RetryingLlm {
    pub fn new(inner: BoxedLlm, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            timeout: None,
        }
    }

    /// Bound every attempt by `timeout`; expiry surfaces as [`Error::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<Completion> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.complete(request))
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.inner.complete(request).await,
        }
    }
}

#[async_trait]
impl Llm for RetryingLlm {
    fn model(&self) -> &str {
        self.inner.model()
    }

    fn usage_id(&self) -> &str {
        self.inner.usage_id()
    }

    fn with_usage_id(&self, usage_id: &str) -> Arc<dyn Llm> {
        Arc::new(Self {
            inner: self.inner.with_usage_id(usage_id),
            config: self.config.clone(),
            timeout: self.timeout,
        })
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(request).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::warn!(
                        model = self.inner.model(),
                        attempt = attempt + 1,
                        ?delay,
                        "Retryable completion error: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
