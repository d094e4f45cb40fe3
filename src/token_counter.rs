//! Token estimation for strings and message batches.
//!
//! The spec's default counter is the simplest possible heuristic
//! (`ceil(len/4)`), used everywhere thresholds are compared unless a caller
//! opts into `TiktokenCounter` for a real encoder-backed estimate (the
//! teacher repository already depends on `tiktoken-rs` for cost estimation;
//! reused here for the same reason).

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// A conversational turn, just enough shape to count tokens over.
pub trait TokenCountable {
    fn token_text(&self) -> &str;
}

impl TokenCountable for str {
    fn token_text(&self) -> &str {
        self
    }
}

impl TokenCountable for String {
    fn token_text(&self) -> &str {
        self.as_str()
    }
}

pub trait TokenCounter: Send + Sync {
    fn count_string(&self, s: &str) -> u32;

    fn count_messages<T: TokenCountable>(&self, msgs: &[T]) -> u32
    where
        Self: Sized,
    {
        msgs.iter().map(|m| self.count_string(m.token_text())).sum()
    }
}

/// Free-function equivalent of `TokenCounter::count_messages` usable through
/// a `dyn TokenCounter` — the trait method itself requires `Self: Sized` to
/// keep the trait object-safe.
pub fn count_messages<T: TokenCountable>(counter: &dyn TokenCounter, msgs: &[T]) -> u32 {
    msgs.iter().map(|m| counter.count_string(m.token_text())).sum()
}

/// `ceil(len(s)/4)` — the spec's explicit default implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_string(&self, s: &str) -> u32 {
        let len = s.chars().count();
        ((len + 3) / 4) as u32
    }
}

/// Real BPE-backed counter using the `cl100k_base` encoding (the encoding
/// used by the model families this engine is expected to sit in front of).
/// Falls back to the heuristic if the encoder fails to load, so callers can
/// always construct one infallibly.
pub struct TiktokenCounter {
    bpe: Option<&'static CoreBPE>,
}

fn cl100k() -> &'static Option<CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok())
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self {
            bpe: cl100k().as_ref(),
        }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_string(&self, s: &str) -> u32 {
        match self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(s).len() as u32,
            None => HeuristicTokenCounter.count_string(s),
        }
    }
}
