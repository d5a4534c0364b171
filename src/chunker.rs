//! Text chunking: splits raw text into overlapping semantic chunks.
//!
//! Two methods are supported: `sentence` packs sentence-bounded runs up to
//! the size limit and carries a sentence-aligned overlap into the next
//! chunk; `fixed` uses exact character windows. All arithmetic is in
//! `char`s so multi-byte text never splits inside a code point.

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Chunking method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMethod {
    #[default]
    Sentence,
    Fixed,
}

/// Options controlling how text is split.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Target maximum chunk length in characters.
    pub size: usize,
    /// Characters shared between adjacent chunks.
    pub overlap: usize,
    pub method: ChunkMethod,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 200,
            method: ChunkMethod::Sentence,
        }
    }
}

/// Split `text` into ordered, non-empty chunks.
pub fn split(text: &str, opts: &ChunkOptions) -> Result<Vec<String>> {
    if opts.size == 0 {
        return Err(RagError::invalid_input("chunk size must be positive"));
    }
    if opts.overlap >= opts.size {
        return Err(RagError::invalid_input(
            "chunk overlap must be smaller than chunk size",
        ));
    }

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunks = match opts.method {
        ChunkMethod::Fixed => split_fixed(text, opts.size, opts.overlap),
        ChunkMethod::Sentence => split_sentences(text, opts.size, opts.overlap),
    };

    Ok(chunks.into_iter().filter(|c| !c.trim().is_empty()).collect())
}

/// Byte-exact (char-exact) sliding windows stepping `size - overlap`.
fn split_fixed(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let step = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Sentence-bounded packing with a sentence-aligned overlap carry.
fn split_sentences(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let sentences = sentence_spans(text);

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for sentence in sentences {
        let sent_len = sentence.chars().count();

        // A single oversized sentence gets hard character windows.
        if sent_len > size {
            if !current.is_empty() {
                chunks.push(current.concat().trim().to_string());
                current.clear();
                current_len = 0;
            }
            chunks.extend(split_fixed(&sentence, size, 0));
            continue;
        }

        if current_len + sent_len > size && !current.is_empty() {
            chunks.push(current.concat().trim().to_string());

            // Carry trailing sentences up to `overlap` characters forward.
            let mut carried: Vec<String> = Vec::new();
            let mut carried_len = 0;
            for prev in current.iter().rev() {
                let prev_len = prev.chars().count();
                if carried_len + prev_len > overlap {
                    break;
                }
                carried_len += prev_len;
                carried.push(prev.clone());
            }
            carried.reverse();
            current = carried;
            current_len = carried_len;
        }

        current_len += sent_len;
        current.push(sentence);
    }

    if !current.is_empty() {
        chunks.push(current.concat().trim().to_string());
    }

    chunks
}

/// Split text into sentences, keeping terminators attached.
fn sentence_spans(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n' | '。') {
            if !current.trim().is_empty() {
                sentences.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize, method: ChunkMethod) -> ChunkOptions {
        ChunkOptions {
            size,
            overlap,
            method,
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = split("hello", &opts(0, 0, ChunkMethod::Fixed)).unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = split("hello", &opts(10, 10, ChunkMethod::Fixed)).unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_text() {
        let chunks = split("   \n\n  ", &ChunkOptions::default()).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = split("Paris is the capital of France.", &opts(128, 0, ChunkMethod::Sentence))
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("Paris"));
    }

    #[test]
    fn test_fixed_windows_exact_overlap() {
        let text: String = "abcdefghij".repeat(10); // 100 chars
        let chunks = split(&text, &opts(40, 10, ChunkMethod::Fixed)).unwrap();

        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            let tail: String = prev[prev.len() - 10..].iter().collect();
            let head: String = next[..10].iter().collect();
            assert_eq!(tail, head, "adjacent fixed chunks must share the overlap");
        }
    }

    #[test]
    fn test_fixed_reconstructs_input() {
        let text: String = "0123456789".repeat(12);
        let chunks = split(&text, &opts(50, 20, ChunkMethod::Fixed)).unwrap();

        let mut rebuilt = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                rebuilt.push_str(chunk);
            } else {
                let chars: Vec<char> = chunk.chars().collect();
                let overlap_len = 20.min(chars.len());
                rebuilt.extend(&chars[overlap_len..]);
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_sentence_chunks_respect_size() {
        let text = "One sentence here. ".repeat(40);
        let chunks = split(&text, &opts(100, 20, ChunkMethod::Sentence)).unwrap();

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            // Tolerance: one sentence may straddle the boundary
            assert!(chunk.chars().count() <= 120, "chunk too long: {chunk}");
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_sentence_overlap_carries_tail() {
        // Short sentences, all below the overlap length, so every chunk
        // boundary carries its trailing sentence forward.
        let text = "Aa one. Bb two. Cc three. Dd four. Ee five. Ff six.";
        let chunks = split(text, &opts(20, 10, ChunkMethod::Sentence)).unwrap();

        assert!(chunks.len() >= 2);
        // Each later chunk starts with a sentence seen at the end of its predecessor
        for pair in chunks.windows(2) {
            let first_word = pair[1].split_whitespace().next().unwrap();
            assert!(
                pair[0].contains(first_word),
                "expected '{}' to appear in previous chunk '{}'",
                first_word,
                pair[0]
            );
        }
    }

    #[test]
    fn test_oversized_sentence_hard_split() {
        let text = "a".repeat(300);
        let chunks = split(&text, &opts(100, 10, ChunkMethod::Sentence)).unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn test_cjk_text_does_not_panic() {
        let text = "これは日本語のテストです。".repeat(50);
        let chunks = split(&text, &opts(100, 20, ChunkMethod::Sentence)).unwrap();
        assert!(chunks.len() >= 2);
        for chunk in chunks {
            assert!(!chunk.is_empty());
        }
    }
}
