//! Token-budgeted context assembly from retrieved chunks. Pure given its
//! inputs; no I/O.

use std::collections::HashSet;

use common::{
    storage::types::document_chunk::DocumentChunk,
    utils::{config::ContextSettings, text::estimate_tokens},
};

/// A retrieval hit hydrated with its chunk row.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStats {
    pub chunks_considered: usize,
    pub chunks_included: usize,
    pub tokens_estimated: usize,
    pub truncated: bool,
    pub deduped_sentences: usize,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub text: String,
    pub stats: ContextStats,
}

const BLOCK_SEPARATOR: &str = "\n\n---\n\n";
const CHARS_PER_TOKEN: usize = 4;

fn format_block(entry: &RetrievedChunk, include_metadata: bool) -> String {
    if !include_metadata {
        return entry.chunk.content.clone();
    }

    let title = entry
        .chunk
        .metadata
        .get("title")
        .map(String::as_str)
        .unwrap_or("untitled");
    let kind = entry
        .chunk
        .metadata
        .get("content_type")
        .map(String::as_str)
        .unwrap_or("unknown");

    format!(
        "[source: {title} | type: {kind} | score: {score:.3}]\n{content}",
        score = entry.score,
        content = entry.chunk.content
    )
}

fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let clipped: String = text.chars().take(max_chars).collect();
    let cut = clipped
        .rfind(char::is_whitespace)
        .filter(|&at| at > 0)
        .unwrap_or(clipped.len());
    let mut result: String = clipped.get(..cut).unwrap_or(&clipped).trim_end().to_string();
    result.push('…');
    result
}

fn split_sentences(block: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in block.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            sentences.push(current.clone());
            current.clear();
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

/// Remove sentences that already appeared in an earlier included block.
fn dedup_sentences(blocks: Vec<String>) -> (Vec<String>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed = 0;
    let deduped = blocks
        .into_iter()
        .map(|block| {
            let mut kept = String::new();
            for sentence in split_sentences(&block) {
                let normalized = sentence.trim().to_string();
                if normalized.is_empty() {
                    kept.push_str(&sentence);
                    continue;
                }
                if seen.contains(&normalized) {
                    removed += 1;
                    continue;
                }
                seen.insert(normalized);
                kept.push_str(&sentence);
            }
            kept.trim_end().to_string()
        })
        .collect();
    (deduped, removed)
}

/// Select and order retrieved blocks under the token budget.
///
/// Input is expected in descending score order (the vector index contract).
/// At least one block is always included; a lone oversized block is cut at a
/// word boundary and suffixed with an ellipsis.
pub fn assemble(chunks: &[RetrievedChunk], settings: &ContextSettings) -> AssembledContext {
    let budget = settings.max_tokens;
    let relevant: Vec<&RetrievedChunk> = chunks
        .iter()
        .filter(|entry| entry.score >= settings.relevance_threshold)
        .collect();

    let mut included: Vec<String> = Vec::new();
    let mut used_tokens = 0usize;
    let mut truncated = false;

    for entry in &relevant {
        let block = format_block(entry, settings.include_metadata);
        let block_tokens = estimate_tokens(&block);

        if used_tokens + block_tokens <= budget {
            used_tokens += block_tokens;
            included.push(block);
        } else if included.is_empty() {
            let clipped = truncate_at_word_boundary(&block, budget * CHARS_PER_TOKEN);
            used_tokens = estimate_tokens(&clipped);
            included.push(clipped);
            truncated = true;
            break;
        } else {
            break;
        }
    }

    let chunks_included = included.len();
    let (deduped, removed) = dedup_sentences(included);
    let text = deduped.join(BLOCK_SEPARATOR);
    let tokens_estimated = estimate_tokens(&text);

    AssembledContext {
        text,
        stats: ContextStats {
            chunks_considered: chunks.len(),
            chunks_included,
            tokens_estimated,
            truncated,
            deduped_sentences: removed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chunk(content: &str, score: f32) -> RetrievedChunk {
        let mut metadata = HashMap::new();
        metadata.insert("title".to_string(), "Doc".to_string());
        metadata.insert("content_type".to_string(), "text/plain".to_string());
        RetrievedChunk {
            chunk: DocumentChunk::new(
                "tenant-a".to_string(),
                "doc-1".to_string(),
                0,
                content.to_string(),
                estimate_tokens(content) as u32,
                0,
                content.len() as u64,
                metadata,
            ),
            score,
        }
    }

    fn settings(max_tokens: usize, threshold: f32, include_metadata: bool) -> ContextSettings {
        ContextSettings {
            max_tokens,
            relevance_threshold: threshold,
            include_metadata,
        }
    }

    #[test]
    fn test_drops_chunks_below_threshold() {
        let chunks = vec![chunk("relevant content here.", 0.9), chunk("noise.", 0.2)];
        let assembled = assemble(&chunks, &settings(1000, 0.7, false));

        assert!(assembled.text.contains("relevant content"));
        assert!(!assembled.text.contains("noise"));
        assert_eq!(assembled.stats.chunks_included, 1);
        assert_eq!(assembled.stats.chunks_considered, 2);
    }

    #[test]
    fn test_budget_stops_accumulation() {
        let big = "x".repeat(400); // 100 tokens
        let chunks = vec![
            chunk(&big, 0.9),
            chunk(&big, 0.85),
            chunk(&big, 0.8),
        ];
        let assembled = assemble(&chunks, &settings(220, 0.7, false));

        assert_eq!(assembled.stats.chunks_included, 2);
        assert!(!assembled.stats.truncated);
        assert!(assembled.stats.tokens_estimated <= 220);
    }

    #[test]
    fn test_single_oversized_block_truncated_with_ellipsis() {
        let long = "word ".repeat(200); // ~250 tokens
        let chunks = vec![chunk(long.trim(), 0.9)];
        let assembled = assemble(&chunks, &settings(50, 0.7, false));

        assert_eq!(assembled.stats.chunks_included, 1);
        assert!(assembled.stats.truncated);
        assert!(assembled.text.ends_with('…'));
        assert!(assembled.stats.tokens_estimated <= 51);
        assert!(
            !assembled.text.trim_end_matches('…').ends_with("wor"),
            "cut lands on a word boundary"
        );
    }

    #[test]
    fn test_metadata_header_toggle() {
        let chunks = vec![chunk("body text.", 0.9)];

        let with = assemble(&chunks, &settings(1000, 0.7, true));
        assert!(with.text.contains("[source: Doc | type: text/plain | score: 0.900]"));

        let without = assemble(&chunks, &settings(1000, 0.7, false));
        assert!(!without.text.contains("[source:"));
    }

    #[test]
    fn test_duplicate_sentences_kept_once() {
        let chunks = vec![
            chunk("Shared fact about caching. Unique one.", 0.9),
            chunk("Shared fact about caching. Unique two.", 0.8),
        ];
        let assembled = assemble(&chunks, &settings(1000, 0.7, false));

        assert_eq!(
            assembled.text.matches("Shared fact about caching.").count(),
            1
        );
        assert!(assembled.text.contains("Unique one."));
        assert!(assembled.text.contains("Unique two."));
        assert_eq!(assembled.stats.deduped_sentences, 1);
    }

    #[test]
    fn test_empty_input_yields_empty_context() {
        let assembled = assemble(&[], &settings(1000, 0.7, true));
        assert!(assembled.text.is_empty());
        assert_eq!(assembled.stats.chunks_included, 0);
        assert_eq!(assembled.stats.tokens_estimated, 0);
    }

    #[test]
    fn test_blocks_joined_with_separator() {
        let chunks = vec![chunk("First block.", 0.9), chunk("Second block.", 0.8)];
        let assembled = assemble(&chunks, &settings(1000, 0.7, false));
        assert!(assembled.text.contains("\n\n---\n\n"));
    }
}
