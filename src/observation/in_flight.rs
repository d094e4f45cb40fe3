//! Process-local registry of records with an async buffered observation
//! currently running (§4.5/§9: "process-wide globals become process-local
//! state on an engine instance"). Purely advisory — it only stops the
//! stale-flag sweep from clearing a buffering flag out from under a task
//! this same process is still running. Grounded on
//! `lexlapax-rs-llmspell`'s `llmspell-memory` use of `dashmap` for
//! process-local concurrent state; the teacher carries no `dashmap`
//! dependency of its own.

use dashmap::DashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<DashSet<Uuid>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record_id: Uuid) {
        self.inner.insert(record_id);
    }

    pub fn unregister(&self, record_id: Uuid) {
        self.inner.remove(&record_id);
    }

    pub fn contains(&self, record_id: Uuid) -> bool {
        self.inner.contains(&record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_round_trips() {
        let registry = InFlightRegistry::new();
        let id = Uuid::now_v7();
        assert!(!registry.contains(id));
        registry.register(id);
        assert!(registry.contains(id));
        registry.unregister(id);
        assert!(!registry.contains(id));
    }
}
