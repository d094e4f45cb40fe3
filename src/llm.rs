//! External LLM collaborator contracts (§6). Out of scope per spec §1; only
//! the interfaces are specified here. Grounded on the teacher's
//! `llm::LlmClient` trait shape — a thin `async_trait` seam with a mock
//! implementation living beside it for tests, same convention this crate
//! uses for `Clock`.

use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default reflector timeout (§4.6).
pub const DEFAULT_REFLECT_TIMEOUT_MS: u64 = 30_000;

/// `observe(activeObservations, messages) → string` (§6). May fail; the
/// caller (the synchronous/async-buffered observation paths) is responsible
/// for any timeout bound.
#[async_trait]
pub trait LlmObserver: Send + Sync {
    async fn observe(&self, active_observations: &str, messages: &[Message]) -> anyhow::Result<String>;
}

/// Output of a reflector call (§4.6 step 3): three bracketed sections plus
/// reported token usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorOutput {
    pub observations: String,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
    pub token_count: Option<u32>,
}

/// `reflect({activeObservations, compressionPrompt?}, model, timeoutMs) →
/// {observations, currentTask?, suggestedResponse?, tokenCount}` (§6).
#[async_trait]
pub trait LlmReflector: Send + Sync {
    async fn reflect(
        &self,
        active_observations: &str,
        compression_prompt: Option<&str>,
        model: &str,
        timeout: Duration,
    ) -> anyhow::Result<ReflectorOutput>;
}

/// Reflector compression-guidance table from §4.6, indexed by retry count.
pub fn compression_guidance(retry_count: u32) -> Option<&'static str> {
    match retry_count {
        0 => None,
        1 => Some("more condensation"),
        _ => Some("aggressive condensation"),
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every call it receives and returns a fixed string, for
    /// asserting the observer ran exactly once with the expected inputs.
    pub struct StaticObserver {
        pub response: String,
        pub calls: AtomicUsize,
        pub last_message_count: Mutex<usize>,
    }

    impl StaticObserver {
        pub fn new(response: impl Into<String>) -> Self {
            Self {
                response: response.into(),
                calls: AtomicUsize::new(0),
                last_message_count: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmObserver for StaticObserver {
        async fn observe(&self, _active_observations: &str, messages: &[Message]) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_message_count.lock().unwrap() = messages.len();
            Ok(self.response.clone())
        }
    }

    pub struct StaticReflector {
        pub observations: String,
    }

    #[async_trait]
    impl LlmReflector for StaticReflector {
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
}
