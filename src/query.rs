//! Contextual query construction for dialogue-driven retrieval.
//!
//! When a caller hands us a conversation instead of a query string, we
//! build a retrieval query from the tail of the dialogue: newest turns
//! are represented most densely, older turns only as far as the
//! character budget allows.

use crate::types::Message;
use lazy_static::lazy_static;
use regex::Regex;

/// Default character budget, sized for the dense encoder's input window.
pub const DEFAULT_CHAR_LIMIT: usize = 500;

lazy_static! {
    // A sentence: anything up to and including a run of terminators,
    // followed by whitespace or end of input.
    static ref SENTENCE_RE: Regex = Regex::new(r"[^.!?]+[.!?]+(\s|$)").unwrap();
}

/// Build a retrieval query from a dialogue.
///
/// Walks messages newest-first; within each message, sentences are
/// accumulated newest-first until the running total reaches
/// `char_limit`. Within-message order is restored when joining, and
/// messages are separated by newlines, so the result reads
/// chronologically with the latest turn fully represented. The final
/// sentence of the final message is always included when non-empty.
pub fn build_contextual_query(messages: &[Message], char_limit: usize) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let mut blocks: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for msg in messages.iter().rev() {
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }

        let mut sentences: Vec<&str> = SENTENCE_RE
            .find_iter(content)
            .map(|m| m.as_str())
            .collect();
        // A message without terminators is a single sentence.
        if sentences.is_empty() {
            sentences = vec![content];
        }

        let mut parts: Vec<&str> = Vec::new();
        for sent in sentences.iter().rev() {
            let sent = sent.trim();
            parts.insert(0, sent);
            current_len += sent.len();
            if current_len >= char_limit {
                break;
            }
        }

        blocks.insert(0, parts.join(" "));

        if current_len >= char_limit {
            break;
        }
    }

    blocks.join("\n")
}
