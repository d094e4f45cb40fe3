//! convoy-memory — multi-tier conversational memory engine for coding-agent
//! runtimes.
//!
//! Four tightly coupled subsystems, leaves-first:
//!
//! - [`message`] / [`task`] — the append-only message log and the task
//!   dependency graph (§4.2, §4.3).
//! - [`working_memory`] — scoped markdown scratch pad (§4.4).
//! - [`observation`] — the threshold-driven observer pipeline: sync,
//!   async-buffered, and crash-recoverable (§4.5).
//! - [`reflection`] — second-stage condensation into generational summaries
//!   (§4.6).
//! - [`context_assembler`] — assembles the 4-level LLM context stack (§4.7).
//!
//! Everything is built against explicit collaborators rather than mutable
//! singletons: a [`store::Store`] for persistence and full-text search, a
//! [`clock::Clock`] for lease expiry, a [`token_counter::TokenCounter`] for
//! threshold comparisons, and the [`llm`] traits for the observer/reflector
//! calls this crate treats as external (§1 scope).

pub mod clock;
pub mod config;
pub mod context_assembler;
pub mod error;
pub mod events;
pub mod llm;
pub mod message;
pub mod observation;
pub mod reflection;
pub mod store;
pub mod task;
pub mod token_counter;
pub mod working_memory;

pub use clock::{Clock, SystemClock};
pub use config::{ObservationConfig, RuntimeConfig, Scope};
pub use error::{CoreError, Result};
pub use message::MessageLog;
pub use observation::ObservationEngine;
pub use reflection::ReflectionEngine;
pub use store::Store;
pub use task::TaskGraph;
pub use working_memory::WorkingMemory;

/// Installs a `tracing-subscriber` `fmt` layer honoring `RUST_LOG`, matching
/// the teacher's env-filter-driven logging setup. Safe to call more than
/// once; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Version information, matching the teacher's `VERSION`/`AUTHORS` re-export
/// convention.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
