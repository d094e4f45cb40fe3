//! Builds the layered LLM context (§4.7): semantic-recall retrieval plus the
//! 4-level injection stack. Grounded on the teacher's
//! `src/brain/agent/service/context.rs` block-formatting convention.

use crate::config::Scope;
use crate::message::{Message, MessageLog, Role};
use crate::reflection::ReflectionEngine;
use crate::observation::ObservationalMemory;
use crate::error::Result;
use crate::token_counter::TokenCounter;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// One block of the 4-level stack, carrying its own token estimate so the
/// caller can budget.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub level: u8,
    pub name: String,
    pub content: String,
    pub token_count: u32,
}

/// `\n<!-- LEVEL n: name -->\n<content>\n` (§4.7).
pub fn format_block(block: &ContextBlock) -> String {
    format!("\n<!-- LEVEL {}: {} -->\n{}\n", block.level, block.name, block.content)
}

/// Input to `ContextAssembler::format_for_agent_input` (§4.7).
pub struct AgentInputResult {
    pub working_memory: Option<String>,
    pub recent_messages: Vec<Message>,
    pub user_message: Message,
}

pub struct ContextAssembler {
    messages: Arc<MessageLog>,
    reflections: Arc<ReflectionEngine>,
    token_counter: Arc<dyn TokenCounter>,
}

impl ContextAssembler {
    pub fn new(messages: Arc<MessageLog>, reflections: Arc<ReflectionEngine>, token_counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            messages,
            reflections,
            token_counter,
        }
    }

    /// §4.7 semantic recall. Degrades to the most recent messages in scope
    /// on search failure or an empty hit set (§7: "semantic-recall
    /// failures degrade to the recent-messages fallback").
    pub async fn semantic_recall(
        &self,
        query: &str,
        thread_id: Option<Uuid>,
        resource_id: Option<String>,
        top_k: u32,
        message_range: i64,
        scope: Scope,
    ) -> Result<Vec<Message>> {
        let search_thread = if scope == Scope::Thread { thread_id } else { None };

        let hits = match self.messages.search(query, Some(top_k), search_thread).await {
            Ok(hits) if !hits.is_empty() => hits,
            _ => return self.messages.list(thread_id, resource_id, Some(10)).await,
        };

        let candidates = self.messages.list(thread_id, resource_id.clone(), Some(200)).await?;

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut selected: Vec<Message> = Vec::new();
        for hit in &hits {
            for candidate in &candidates {
                if candidate.thread_id == hit.message.thread_id
                    && (candidate.message_index - hit.message.message_index).abs() <= message_range
                    && seen.insert(candidate.id)
                {
                    selected.push(candidate.clone());
                }
            }
        }

        if selected.is_empty() {
            return self.messages.list(thread_id, resource_id, Some(10)).await;
        }

        selected.sort_by(|a, b| {
            (a.thread_id, a.message_index, a.created_at).cmp(&(b.thread_id, b.message_index, b.created_at))
        });
        Ok(selected)
    }

    /// §4.7 4-level stack.
    pub async fn build_context(
        &self,
        thread_id: Uuid,
        record: &ObservationalMemory,
        recent_messages: &[Message],
    ) -> Result<Vec<ContextBlock>> {
        let reflections = self.reflections.recent_for_thread(thread_id, 5).await?;
        let reflections_content = reflections
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let recent_observations_content =
            last_non_blank_lines(&record.active_observations, record.config.max_recent_observations);

        let recent_messages_content = tail(recent_messages, record.config.last_messages as usize)
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.raw_content))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(vec![
            self.make_block(1, "reflections", reflections_content),
            self.make_block(2, "recent-observations", recent_observations_content),
            self.make_block(3, "recent-messages", recent_messages_content),
            self.make_block(4, "on-demand", String::new()),
        ])
    }

    fn make_block(&self, level: u8, name: &str, content: String) -> ContextBlock {
        let token_count = self.token_counter.count_string(&content);
        ContextBlock {
            level,
            name: name.to_string(),
            content,
            token_count,
        }
    }

    /// `formatForAgentInput` (§4.7): system prompt, an optional
    /// `<working-memory>` block, up to the last five non-tool recent
    /// messages in their original roles, then the user's original message.
    pub fn format_for_agent_input(&self, input: &AgentInputResult, system_prompt: &str) -> String {
        let mut out = String::from(system_prompt);

        if let Some(wm) = &input.working_memory {
            if !wm.trim().is_empty() {
                out.push_str(&format!("\n<working-memory>\n{wm}\n</working-memory>\n"));
            }
        }

        let non_tool: Vec<&Message> = input.recent_messages.iter().filter(|m| m.role != Role::Tool).collect();
        for m in tail(&non_tool.into_iter().cloned().collect::<Vec<_>>(), 5) {
            out.push_str(&format!("\n{}: {}\n", m.role.as_str(), m.raw_content));
        }

        out.push_str(&format!("\n{}\n", input.user_message.raw_content));
        out
    }
}

fn tail(messages: &[Message], n: usize) -> Vec<Message> {
    let start = messages.len().saturating_sub(n);
    messages[start..].to_vec()
}

fn last_non_blank_lines(text: &str, n: u32) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n as usize);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ObservationConfig;
    use crate::llm::mock::StaticReflector;
    use crate::message::AppendMessageInput;
    use crate::store::Store;

    async fn assembler() -> (ContextAssembler, Arc<MessageLog>, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(SystemClock);
        let messages = Arc::new(MessageLog::new(store.clone(), clock.clone()));
        let reflector = Arc::new(StaticReflector {
            observations: "x".to_string(),
        });
        let reflections = Arc::new(ReflectionEngine::new(store, clock, reflector, "instance-a".to_string(), 30_000));
        let token_counter = Arc::new(crate::token_counter::HeuristicTokenCounter);
        let thread_id = Uuid::now_v7();
        (ContextAssembler::new(messages.clone(), reflections, token_counter), messages, thread_id)
    }

    #[tokio::test]
    async fn bm25_recall_selects_symmetric_window_around_hit() {
        let (assembler, messages, thread_id) = assembler().await;

        let bodies = [
            "first message",
            "second message",
            "third message",
            "the semantic_needle token appears here",
            "fifth message",
            "sixth message",
        ];
        for body in bodies {
            messages
                .append(AppendMessageInput {
                    thread_id,
                    role: Some(Role::Assistant),
                    raw_content: body.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let selected = assembler
            .semantic_recall("semantic_needle token", Some(thread_id), None, 1, 1, Scope::Thread)
            .await
            .unwrap();

        let indices: Vec<i64> = selected.iter().map(|m| m.message_index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn recall_falls_back_to_recent_messages_when_search_is_empty() {
        let (assembler, messages, thread_id) = assembler().await;
        for i in 0..3 {
            messages
                .append(AppendMessageInput {
                    thread_id,
                    raw_content: format!("plain message {i}"),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let selected = assembler
            .semantic_recall("nothing_matches_this", Some(thread_id), None, 1, 1, Scope::Thread)
            .await
            .unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[tokio::test]
    async fn build_context_produces_four_ordered_levels() {
        let (assembler, _messages, thread_id) = assembler().await;
        let record =
            ObservationalMemory::new(Some(thread_id), None, ObservationConfig::new(Scope::Thread)).unwrap();
        let blocks = assembler.build_context(thread_id, &record, &[]).await.unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks.iter().map(|b| b.level).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(blocks[3].content, "");
    }
}
