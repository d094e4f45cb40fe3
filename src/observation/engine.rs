//! The three-mode observer pipeline (§4.5) — threshold calculation, the
//! synchronous and async-buffered observation paths, and the stale-flag
//! sweep that is the system's sole crash-recovery mechanism. Grounded on
//! the teacher's `*Service` wrapper over `Store` for the surrounding shape;
//! the state machine itself has no retrieved-file analogue and is
//! transcribed directly from the spec's step algorithm.

use super::in_flight::InFlightRegistry;
use super::lease;
use super::record::{self, BufferedObservationChunk, ObservationalMemory};
use crate::clock::Clock;
use crate::config::{ObservationConfig, Scope};
use crate::error::{CoreError, Result};
use crate::llm::LlmObserver;
use crate::message::Message;
use crate::reflection::ReflectionEngine;
use crate::store::Store;
use crate::token_counter::{self, TokenCounter};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Input to `ObservationEngine::process_step` (§4.5 "Processing one step").
pub struct ProcessStepInput {
    pub thread_id: Option<Uuid>,
    pub resource_id: Option<String>,
    pub config: ObservationConfig,
    pub messages: Vec<Message>,
    pub step_number: u32,
    pub read_only: bool,
    pub reflector_model: Option<String>,
}

/// Output of one step: the caller-visible effects (§4.5 step 8).
pub struct ProcessStepOutput {
    pub messages: Vec<Message>,
    pub record: ObservationalMemory,
    pub observations_injected: bool,
    pub did_observe: bool,
}

pub struct ObservationEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LlmObserver>,
    token_counter: Arc<dyn TokenCounter>,
    reflection: Option<Arc<ReflectionEngine>>,
    in_flight: InFlightRegistry,
    instance_id: String,
    lease_ms: i64,
    disable_async_observation: bool,
}

impl ObservationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn LlmObserver>,
        token_counter: Arc<dyn TokenCounter>,
        reflection: Option<Arc<ReflectionEngine>>,
        instance_id: String,
        lease_ms: i64,
        disable_async_observation: bool,
    ) -> Self {
        Self {
            store,
            clock,
            observer,
            token_counter,
            reflection,
            in_flight: InFlightRegistry::new(),
            instance_id,
            lease_ms,
            disable_async_observation,
        }
    }

    /// §4.5 "Processing one step", steps 1-8.
    pub async fn process_step(&self, input: ProcessStepInput) -> Result<ProcessStepOutput> {
        let mut record = record::fetch_or_create(
            &self.store,
            input.thread_id,
            input.resource_id.clone(),
            input.config.clone(),
        )
        .await?;

        if self.stale_flag_sweep(&mut record) {
            record::save(&self.store, &record, self.clock.now_millis()).await?;
        }

        let other_thread_tokens = if record.scope == Scope::Resource {
            self.other_thread_tokens(record.resource_id.as_deref()).await?
        } else {
            0
        };

        let all_message_tokens = token_counter::count_messages(self.token_counter.as_ref(), &input.messages);
        let current_observation_tokens = self.token_counter.count_string(&record.active_observations);
        let pending_from_storage = record.pending_from_storage();
        let pending_total = all_message_tokens + other_thread_tokens + pending_from_storage + current_observation_tokens;
        let threshold = record.config.observation_threshold;

        // Step 3: buffer activation, step 0 only.
        if input.step_number == 0 && !record.buffered_observation_chunks.is_empty() {
            let activation_tokens = record.config.activation_tokens();
            if pending_total >= activation_tokens {
                self.activate_buffer(&mut record).await?;
            }
        }

        // Step 4.
        let observed: HashSet<Uuid> = record.observed_message_ids.iter().copied().collect();
        let unobserved: Vec<Message> = input
            .messages
            .iter()
            .filter(|m| !observed.contains(&m.id))
            .cloned()
            .collect();

        let mut did_observe = false;

        if !input.read_only && !unobserved.is_empty() {
            let tokens_since_last_buffer = match record.last_buffered_at_tokens {
                Some(last) => pending_total.saturating_sub(last),
                None => pending_total,
            };

            // Step 5.
            if !self.disable_async_observation
                && pending_total < threshold
                && tokens_since_last_buffer >= record.config.buffer_tokens
            {
                self.start_async_buffered_observation(&mut record, &unobserved, pending_total)
                    .await?;
            }

            // Step 6.
            if input.step_number > 0 && pending_total >= threshold {
                did_observe = self.observe_sync(&mut record, &unobserved).await?;
            }
        }

        // Step 7.
        if let (Some(model), Some(reflection)) = (&input.reflector_model, &self.reflection) {
            let active_tokens = self.token_counter.count_string(&record.active_observations);
            if active_tokens >= record.config.reflection_threshold {
                match reflection.reflect(record.id, model).await {
                    Ok(updated) => record = updated,
                    Err(CoreError::Conflict(_)) => {
                        debug!(record_id = %record.id, "reflection lease held elsewhere, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Step 8.
        let observed_final: HashSet<Uuid> = record.observed_message_ids.iter().copied().collect();
        let filtered_messages: Vec<Message> = input
            .messages
            .into_iter()
            .filter(|m| !observed_final.contains(&m.id))
            .collect();
        let observations_injected = !record.active_observations.is_empty();

        Ok(ProcessStepOutput {
            messages: filtered_messages,
            observations_injected,
            did_observe,
            record,
        })
    }

    async fn activate_buffer(&self, record: &mut ObservationalMemory) -> Result<()> {
        let mut combined = record.active_observations.clone();
        for chunk in &record.buffered_observation_chunks {
            if !combined.is_empty() {
                combined.push_str("\n\n");
            }
            combined.push_str(&chunk.content);
        }
        record.active_observations = combined;
        record.buffered_observation_chunks.clear();
        record.is_buffering_observation = false;
        record::save(&self.store, record, self.clock.now_millis()).await
    }

    /// §4.5 synchronous observation path.
    async fn observe_sync(&self, record: &mut ObservationalMemory, unobserved: &[Message]) -> Result<bool> {
        let Some(acquired) =
            lease::acquire(&self.store, self.clock.as_ref(), record.id, &self.instance_id, self.lease_ms).await?
        else {
            debug!(record_id = %record.id, "observation lease held elsewhere, skipping");
            return Ok(false);
        };
        let operation_id = acquired.operation_id;

        // `record::save` writes every lock column, so mirror what
        // `acquire` just wrote onto the DB row before the first save —
        // otherwise the save would clobber it back to NULL and release
        // the lease the instant it was taken.
        record.lock_owner_id = Some(self.instance_id.clone());
        record.lock_expires_at = Some(acquired.expires_at);
        record.lock_operation_id = Some(operation_id);
        record.last_heartbeat_at = Some(acquired.heartbeat_at);
        record.is_observing = true;
        record::save(&self.store, record, self.clock.now_millis()).await?;

        match self.observer.observe(&record.active_observations, unobserved).await {
            Ok(text) => {
                if record.active_observations.is_empty() {
                    record.active_observations = text;
                } else {
                    record.active_observations.push_str("\n\n");
                    record.active_observations.push_str(&text);
                }
                record.observed_message_ids.extend(unobserved.iter().map(|m| m.id));
                record.last_observed_at = Some(self.clock.now());
                record.is_observing = false;
                record::save(&self.store, record, self.clock.now_millis()).await?;
                lease::release(&self.store, record.id, &self.instance_id, operation_id).await?;
                Self::clear_lease_fields(record);
                Ok(true)
            }
            Err(e) => {
                record.is_observing = false;
                record::save(&self.store, record, self.clock.now_millis()).await?;
                lease::release(&self.store, record.id, &self.instance_id, operation_id).await?;
                Self::clear_lease_fields(record);
                Err(CoreError::Storage(e.to_string()))
            }
        }
    }

    /// Mirrors `lease::release`'s DB-side clear onto the in-memory record
    /// so the value handed back to callers doesn't disagree with storage.
    fn clear_lease_fields(record: &mut ObservationalMemory) {
        record.lock_owner_id = None;
        record.lock_expires_at = None;
        record.lock_operation_id = None;
        record.last_heartbeat_at = None;
    }

    /// §4.5 async buffered observation path. Spawns the observer call so it
    /// runs concurrently with the rest of step processing; this function
    /// itself never blocks on the observer's completion.
    async fn start_async_buffered_observation(
        &self,
        record: &mut ObservationalMemory,
        unobserved: &[Message],
        pending_total: u32,
    ) -> Result<()> {
        let Some(acquired) =
            lease::acquire(&self.store, self.clock.as_ref(), record.id, &self.instance_id, self.lease_ms).await?
        else {
            debug!(record_id = %record.id, "buffer lease held elsewhere, skipping");
            return Ok(());
        };
        let operation_id = acquired.operation_id;

        // See the matching comment in `observe_sync`: `record::save` writes
        // every lock column, so the acquired lease must be mirrored onto
        // `record` before that first save or it gets released immediately.
        record.lock_owner_id = Some(self.instance_id.clone());
        record.lock_expires_at = Some(acquired.expires_at);
        record.lock_operation_id = Some(operation_id);
        record.last_heartbeat_at = Some(acquired.heartbeat_at);
        record.is_buffering_observation = true;
        record.last_buffered_at_tokens = Some(pending_total);
        record.last_buffered_at_time = Some(self.clock.now());
        record::save(&self.store, record, self.clock.now_millis()).await?;

        self.in_flight.register(record.id);

        let store = self.store.clone();
        let clock = self.clock.clone();
        let observer = self.observer.clone();
        let in_flight = self.in_flight.clone();
        let instance_id = self.instance_id.clone();
        let record_id = record.id;
        let active_observations = record.active_observations.clone();
        let unobserved = unobserved.to_vec();
        let message_tokens = token_counter::count_messages(self.token_counter.as_ref(), &unobserved);

        tokio::spawn(async move {
            let outcome = observer.observe(&active_observations, &unobserved).await;
            let mut record = match record::reload(&store, record_id).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(record_id = %record_id, error = %e, "failed to reload record after buffered observation");
                    in_flight.unregister(record_id);
                    let _ = lease::release(&store, record_id, &instance_id, operation_id).await;
                    return;
                }
            };

            match outcome {
                Ok(text) => {
                    record.buffered_observation_chunks.push(BufferedObservationChunk {
                        content: text,
                        message_ids: unobserved.iter().map(|m| m.id).collect(),
                        message_tokens,
                        created_at: Utc::now(),
                    });
                    record.observed_message_ids.extend(unobserved.iter().map(|m| m.id));
                    record.last_observed_at = Some(clock.now());
                    record.is_buffering_observation = false;
                }
                Err(e) => {
                    warn!(record_id = %record_id, error = %e, "buffered observation failed");
                    record.is_buffering_observation = false;
                }
            }

            if let Err(e) = record::save(&store, &record, clock.now_millis()).await {
                warn!(record_id = %record_id, error = %e, "failed to persist buffered observation result");
            }
            let _ = lease::release(&store, record_id, &instance_id, operation_id).await;
            in_flight.unregister(record_id);
        });

        Ok(())
    }

    /// §4.5 stale-flag sweep — the sole crash-recovery mechanism. Clears
    /// buffering flags and the lease tuple when this process has no
    /// matching in-flight op registered.
    fn stale_flag_sweep(&self, record: &mut ObservationalMemory) -> bool {
        let mut changed = false;
        let locally_in_flight = self.in_flight.contains(record.id);

        if record.is_buffering_observation && !locally_in_flight {
            record.is_buffering_observation = false;
            record.last_buffered_at_time = None;
            changed = true;
        }
        if record.is_buffering_reflection && !locally_in_flight {
            record.is_buffering_reflection = false;
            changed = true;
        }
        if let Some(expires_at) = record.lock_expires_at {
            if expires_at < self.clock.now() && !locally_in_flight {
                record.lock_owner_id = None;
                record.lock_expires_at = None;
                record.lock_operation_id = None;
                record.last_heartbeat_at = None;
                changed = true;
            }
        }
        changed
    }

    /// §4.5 step 2 / §9 open question: `loadOtherThreadsContext` is
    /// specified but not populated by the original implementation. The
    /// interface is preserved; it always returns 0 until a defined
    /// aggregation policy exists.
    async fn other_thread_tokens(&self, _resource_id: Option<&str>) -> Result<u32> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::llm::mock::StaticObserver;
    use crate::message::{AppendMessageInput, MessageLog, Role};
    use crate::token_counter::HeuristicTokenCounter;

    fn engine(observer: Arc<dyn LlmObserver>, store: Store, clock: Arc<dyn Clock>) -> ObservationEngine {
        ObservationEngine::new(
            store,
            clock,
            observer,
            Arc::new(HeuristicTokenCounter),
            None,
            "instance-a".to_string(),
            30_000,
            false,
        )
    }

    async fn make_messages(log: &MessageLog, thread_id: Uuid, n: usize, body: &str) -> Vec<Message> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(
                log.append(AppendMessageInput {
                    thread_id,
                    role: Some(Role::User),
                    raw_content: body.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap(),
            );
        }
        out
    }

    #[tokio::test]
    async fn sync_observation_fires_at_pending_equal_threshold_not_before() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let log = MessageLog::new(store.clone(), clock.clone());
        let thread_id = Uuid::now_v7();

        // "x" * 120000 chars -> 30000 tokens under ceil(len/4).
        let body = "x".repeat(120_000);
        let messages = make_messages(&log, thread_id, 1, &body).await;

        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer.clone(), store, clock);

        let mut config = ObservationConfig::new(Scope::Thread);
        config.observation_threshold = 30_000;

        let output = engine
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

        assert!(output.did_observe);
        assert_eq!(observer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!output.record.active_observations.is_empty());
        assert!(output.messages.is_empty());
    }

    #[tokio::test]
    async fn sync_observation_does_not_fire_below_threshold() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let log = MessageLog::new(store.clone(), clock.clone());
        let thread_id = Uuid::now_v7();

        let body = "x".repeat(4_000); // 1000 tokens, well under threshold
        let messages = make_messages(&log, thread_id, 1, &body).await;

        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer.clone(), store, clock);

        let mut config = ObservationConfig::new(Scope::Thread);
        config.observation_threshold = 30_000;
        config.buffer_tokens = 500; // force an async buffer instead

        let output = engine
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

        assert!(!output.did_observe);
    }

    #[tokio::test]
    async fn sync_observation_never_fires_at_step_zero() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let log = MessageLog::new(store.clone(), clock.clone());
        let thread_id = Uuid::now_v7();

        let body = "x".repeat(120_000);
        let messages = make_messages(&log, thread_id, 1, &body).await;

        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer.clone(), store, clock);

        let mut config = ObservationConfig::new(Scope::Thread);
        config.observation_threshold = 30_000;

        let output = engine
            .process_step(ProcessStepInput {
                thread_id: Some(thread_id),
                resource_id: None,
                config,
                messages,
                step_number: 0,
                read_only: false,
                reflector_model: None,
            })
            .await
            .unwrap();

        assert!(!output.did_observe);
    }

    #[tokio::test]
    async fn read_only_step_never_mutates_the_record() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let log = MessageLog::new(store.clone(), clock.clone());
        let thread_id = Uuid::now_v7();

        let body = "x".repeat(120_000);
        let messages = make_messages(&log, thread_id, 1, &body).await;

        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer.clone(), store, clock);

        let mut config = ObservationConfig::new(Scope::Thread);
        config.observation_threshold = 30_000;

        let output = engine
            .process_step(ProcessStepInput {
                thread_id: Some(thread_id),
                resource_id: None,
                config,
                messages,
                step_number: 2,
                read_only: true,
                reflector_model: None,
            })
            .await
            .unwrap();

        assert!(!output.did_observe);
        assert_eq!(observer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_record_with_no_trigger_is_a_no_op() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let log = MessageLog::new(store.clone(), clock.clone());
        let thread_id = Uuid::now_v7();

        let messages = make_messages(&log, thread_id, 1, "hi").await;
        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer.clone(), store, clock);

        let config = ObservationConfig::new(Scope::Thread);
        let output = engine
            .process_step(ProcessStepInput {
                thread_id: Some(thread_id),
                resource_id: None,
                config,
                messages,
                step_number: 1,
                read_only: false,
                reflector_model: None,
            })
            .await
            .unwrap();

        assert!(!output.did_observe);
        assert!(output.record.active_observations.is_empty());
        assert!(output.record.buffered_observation_chunks.is_empty());
    }

    #[tokio::test]
    async fn stale_buffering_flag_is_cleared_with_no_local_in_flight_op() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::DateTime::from_timestamp_millis(0).unwrap()));
        let mut record =
            record::fetch_or_create(&store, Some(Uuid::now_v7()), None, ObservationConfig::new(Scope::Thread))
                .await
                .unwrap();
        record.is_buffering_observation = true;
        record::save(&store, &record, 0).await.unwrap();

        let observer = Arc::new(StaticObserver::new("summary"));
        let engine = engine(observer, store.clone(), clock);

        let output = engine
            .process_step(ProcessStepInput {
                thread_id: record.thread_id,
                resource_id: None,
                config: record.config.clone(),
                messages: Vec::new(),
                step_number: 1,
                read_only: true,
                reflector_model: None,
            })
            .await
            .unwrap();

        assert!(!output.record.is_buffering_observation);
    }
}
