//! Exercises `Clock` and `LlmReflector` through `mockall`-generated mocks
//! rather than the crate's own hand-written test doubles (`FixedClock`,
//! `llm::mock::StaticReflector`), to pin down call-count/argument
//! expectations the way `mockall::mock!` is meant to.
//!
//! `#[automock]` isn't an option here since that requires annotating the
//! trait definitions themselves (`src/clock.rs`, `src/llm.rs`); `mock!`
//! reconstructs the trait signature against an externally-defined trait
//! without touching the source crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_memory::clock::Clock;
use convoy_memory::config::{ObservationConfig, Scope};
use convoy_memory::llm::{LlmReflector, ReflectorOutput};
use convoy_memory::observation::{ObservationEngine, ProcessStepInput};
use convoy_memory::message::{AppendMessageInput, MessageLog};
use convoy_memory::reflection::ReflectionEngine;
use convoy_memory::token_counter::HeuristicTokenCounter;
use convoy_memory::Store;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

mockall::mock! {
    pub ClockDouble {}

    impl Clock for ClockDouble {
        fn now(&self) -> DateTime<Utc>;
    }
}

mockall::mock! {
    pub ReflectorDouble {}

    #[async_trait]
    impl LlmReflector for ReflectorDouble {
        async fn reflect(
            &self,
            active_observations: &str,
            compression_prompt: Option<&str>,
            model: &str,
            timeout: Duration,
        ) -> anyhow::Result<ReflectorOutput>;
    }
}

#[tokio::test]
async fn reflect_calls_reflector_once_with_the_accumulated_observations() {
    let store = Store::open_in_memory().await.unwrap();

    let mut clock_mock = MockClockDouble::new();
    let fixed_instant = DateTime::from_timestamp_millis(1_000_000).unwrap();
    clock_mock.expect_now().returning(move || fixed_instant);
    let clock: Arc<dyn Clock> = Arc::new(clock_mock);

    let log = MessageLog::new(store.clone(), clock.clone());
    let thread_id = Uuid::now_v7();
    let messages = vec![
        log.append(AppendMessageInput {
            thread_id,
            raw_content: "x".repeat(120_000), // 30_000 tokens, at default threshold
            ..Default::default()
        })
        .await
        .unwrap(),
    ];

    let observer = Arc::new(StaticObserverForReflectSetup);
    let engine = ObservationEngine::new(
        store.clone(),
        clock.clone(),
        observer,
        Arc::new(HeuristicTokenCounter),
        None,
        "instance-a".to_string(),
        30_000,
        true,
    );

    let mut config = ObservationConfig::new(Scope::Thread);
    config.observation_threshold = 30_000;

    let step = engine
        .process_step(ProcessStepInput {
            thread_id: Some(thread_id),
            resource_id: None,
            config,
            messages,
            step_number: 2,
            read_only: false,
            reflector_model: None,
        })
        .await
        .unwrap();
    assert!(step.did_observe);
    let record_id = step.record.id;

    let mut reflector_mock = MockReflectorDouble::new();
    reflector_mock
        .expect_reflect()
        .times(1)
        .withf(|active_observations, compression_prompt, model, _timeout| {
            !active_observations.is_empty() && compression_prompt.is_none() && model == "gpt-test"
        })
        .returning(|_, _, _, _| {
            Ok(ReflectorOutput {
                observations: "condensed via mock".to_string(),
                current_task: None,
                suggested_response: None,
                token_count: Some(12),
            })
        });

    let reflector: Arc<dyn LlmReflector> = Arc::new(reflector_mock);
    let reflections = ReflectionEngine::new(store, clock, reflector, "instance-a".to_string(), 30_000);

    let updated = reflections.reflect(record_id, "gpt-test").await.unwrap();
    assert_eq!(updated.active_observations, "condensed via mock");
    assert_eq!(updated.generation_count, 1);
}

/// Minimal observer stand-in just to get `active_observations` populated
/// ahead of the reflection call under test; the mock under test here is
/// the reflector, not the observer.
struct StaticObserverForReflectSetup;

#[async_trait]
impl convoy_memory::llm::LlmObserver for StaticObserverForReflectSetup {
    async fn observe(&self, _active_observations: &str, _messages: &[convoy_memory::message::Message]) -> anyhow::Result<String> {
        Ok("observed body".to_string())
    }
}
