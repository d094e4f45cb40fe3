//! Shared test doubles for the integration-test crates under `tests/`.
//!
//! `llm::mock::{StaticObserver, StaticReflector}` are `#[cfg(test)]`-gated
//! inside the library crate, so they aren't visible here — each integration
//! test binary is compiled separately, not under `--cfg test` for the lib.

use async_trait::async_trait;
use convoy_memory::llm::{LlmObserver, LlmReflector, ReflectorOutput};
use convoy_memory::message::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Records call count and returns a fixed response string.
pub struct FixedObserver {
    response: String,
    calls: AtomicUsize,
}

impl FixedObserver {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmObserver for FixedObserver {
    async fn observe(&self, _active_observations: &str, _messages: &[Message]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// Returns a fixed condensed observation string, for reflection tests.
pub struct FixedReflector {
    observations: String,
}

impl FixedReflector {
    pub fn new(observations: impl Into<String>) -> Self {
        Self {
            observations: observations.into(),
        }
    }
}

#[async_trait]
impl LlmReflector for FixedReflector {
    async fn reflect(
        &self,
        _active_observations: &str,
        _compression_prompt: Option<&str>,
        _model: &str,
        _timeout: Duration,
    ) -> anyhow::Result<ReflectorOutput> {
        Ok(ReflectorOutput {
            observations: self.observations.clone(),
            current_task: None,
            suggested_response: None,
            token_count: None,
        })
    }
}
