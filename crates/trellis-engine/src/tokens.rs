use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;

use trellis_core::config::TokenCounterKind;

/// Estimates the token cost of a memory item's content.
pub trait TokenCounter: Send + Sync + 'static {
    fn count(&self, text: &str) -> usize;
}

/// Get or initialize the tokenizer for cl100k_base.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

/// BPE tokenization (cl100k_base).
#[derive(Debug, Default, Clone, Copy)]
pub struct BpeCounter;

impl TokenCounter for BpeCounter {
    fn count(&self, text: &str) -> usize {
        tokenizer().encode_ordinary(text).len()
    }
}

/// One token per whitespace-separated word. Deterministic and cheap.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

pub fn counter_for(kind: TokenCounterKind) -> Arc<dyn TokenCounter> {
    match kind {
        TokenCounterKind::Bpe => Arc::new(BpeCounter),
        TokenCounterKind::Words => Arc::new(WordCounter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_counter() {
        assert_eq!(WordCounter.count("one two  three\nfour"), 4);
        assert_eq!(WordCounter.count(""), 0);
    }

    #[test]
    fn test_bpe_counter() {
        assert_eq!(BpeCounter.count("hello"), 1);
        assert!(BpeCounter.count("The quick brown fox jumps over the lazy dog.") > 5);
    }
}
