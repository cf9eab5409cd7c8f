use common::{
    error::AppError,
    utils::{config::ChunkingSettings, text::estimate_tokens},
};
use text_splitter::{ChunkCapacity, ChunkConfig, TextSplitter};

/// Rough character width of one estimated token, shared with the token
/// estimator in `common::utils::text`.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Split at fixed token boundaries, repeating the tail of the previous
    /// chunk at the head of the next.
    Fixed {
        target_tokens: usize,
        overlap_tokens: usize,
    },
    /// Split at paragraph/sentence boundaries under a hard token cap; small
    /// trailing fragments are merged into the previous chunk.
    Semantic {
        min_tokens: usize,
        max_tokens: usize,
    },
    /// Fixed-width window advanced by a stride smaller than the window.
    Sliding {
        window_tokens: usize,
        stride_tokens: usize,
    },
}

impl ChunkStrategy {
    pub fn from_settings(settings: &ChunkingSettings) -> Result<Self, AppError> {
        match settings.strategy.as_str() {
            "fixed" => Ok(ChunkStrategy::Fixed {
                target_tokens: settings.target_tokens,
                overlap_tokens: settings.overlap_tokens,
            }),
            "semantic" => Ok(ChunkStrategy::Semantic {
                min_tokens: settings.min_tokens,
                max_tokens: settings.max_tokens,
            }),
            "sliding" => Ok(ChunkStrategy::Sliding {
                window_tokens: settings.window_tokens,
                stride_tokens: settings.stride_tokens,
            }),
            other => Err(AppError::Validation(format!(
                "unknown chunking strategy '{other}'"
            ))),
        }
    }
}

/// One chunk of extracted text with its position in the original.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub ordinal: u32,
    pub content: String,
    pub token_count: u32,
    pub start_char: usize,
    pub end_char: usize,
}

fn piece(ordinal: usize, content: String, start_char: usize, end_char: usize) -> ChunkPiece {
    let token_count = estimate_tokens(&content) as u32;
    ChunkPiece {
        ordinal: ordinal as u32,
        content,
        token_count,
        start_char,
        end_char,
    }
}

/// Split extracted text into ordered chunks. Empty or whitespace-only input
/// yields no chunks; ordinals always run 0..n with no gaps.
pub fn split_text(text: &str, strategy: ChunkStrategy) -> Result<Vec<ChunkPiece>, AppError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    match strategy {
        ChunkStrategy::Fixed {
            target_tokens,
            overlap_tokens,
        } => split_fixed(text, target_tokens, overlap_tokens),
        ChunkStrategy::Semantic {
            min_tokens,
            max_tokens,
        } => split_semantic(text, min_tokens, max_tokens),
        ChunkStrategy::Sliding {
            window_tokens,
            stride_tokens,
        } => split_sliding(text, window_tokens, stride_tokens),
    }
}

fn split_fixed(
    text: &str,
    target_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<ChunkPiece>, AppError> {
    if target_tokens == 0 {
        return Err(AppError::Validation(
            "fixed chunking requires target_tokens > 0".to_string(),
        ));
    }
    if overlap_tokens >= target_tokens {
        return Err(AppError::Validation(format!(
            "chunk overlap of {overlap_tokens} tokens must be smaller than the target of {target_tokens}"
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let target_chars = target_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let mut pieces = Vec::new();
    let mut boundary = 0;
    while boundary < chars.len() {
        let core_end = (boundary + target_chars).min(chars.len());
        let start = boundary.saturating_sub(overlap_chars);
        let content: String = chars
            .get(start..core_end)
            .unwrap_or_default()
            .iter()
            .collect();
        pieces.push(piece(pieces.len(), content, start, core_end));
        boundary = core_end;
    }

    Ok(pieces)
}

fn split_semantic(
    text: &str,
    min_tokens: usize,
    max_tokens: usize,
) -> Result<Vec<ChunkPiece>, AppError> {
    if min_tokens == 0 || min_tokens > max_tokens {
        return Err(AppError::Validation(
            "invalid chunk token bounds; ensure 0 < min <= max".to_string(),
        ));
    }

    let capacity = ChunkCapacity::new(min_tokens * CHARS_PER_TOKEN)
        .with_max(max_tokens * CHARS_PER_TOKEN)
        .map_err(|e| AppError::Validation(format!("invalid chunk token bounds: {e}")))?;
    let splitter = TextSplitter::new(ChunkConfig::new(capacity));

    // chunk_indices yields byte offsets; positions are tracked in characters.
    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut seen_bytes = 0;
    let mut seen_chars = 0;
    for (byte_offset, chunk) in splitter.chunk_indices(text) {
        let skipped = text
            .get(seen_bytes..byte_offset)
            .map_or(0, |gap| gap.chars().count());
        let start_char = seen_chars + skipped;
        let chunk_chars = chunk.chars().count();

        pieces.push(piece(
            pieces.len(),
            chunk.to_string(),
            start_char,
            start_char + chunk_chars,
        ));

        seen_bytes = byte_offset + chunk.len();
        seen_chars = start_char + chunk_chars;
    }

    // A trailing fragment below the minimum is folded into its predecessor.
    let undersized_tail = pieces.len() > 1
        && pieces
            .last()
            .is_some_and(|last| (last.token_count as usize) < min_tokens);
    if undersized_tail {
        if let Some(tail) = pieces.pop() {
            if let Some(previous) = pieces.last_mut() {
                if tail.start_char > previous.end_char {
                    previous.content.push(' ');
                }
                previous.content.push_str(&tail.content);
                previous.end_char = tail.end_char;
                previous.token_count = estimate_tokens(&previous.content) as u32;
            }
        }
    }

    Ok(pieces)
}

fn split_sliding(
    text: &str,
    window_tokens: usize,
    stride_tokens: usize,
) -> Result<Vec<ChunkPiece>, AppError> {
    if window_tokens == 0 || stride_tokens == 0 {
        return Err(AppError::Validation(
            "sliding chunking requires window and stride > 0".to_string(),
        ));
    }
    if stride_tokens >= window_tokens {
        return Err(AppError::Validation(format!(
            "stride of {stride_tokens} tokens must be smaller than the window of {window_tokens}"
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let window_chars = window_tokens * CHARS_PER_TOKEN;
    let stride_chars = stride_tokens * CHARS_PER_TOKEN;

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window_chars).min(chars.len());
        let content: String = chars.get(start..end).unwrap_or_default().iter().collect();
        pieces.push(piece(pieces.len(), content, start, end));

        if end == chars.len() {
            break;
        }
        start += stride_chars;
    }

    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        let strategy = ChunkStrategy::Fixed {
            target_tokens: 2,
            overlap_tokens: 0,
        };
        assert!(split_text("", strategy).expect("empty").is_empty());
        assert!(split_text("   \n\t  ", strategy).expect("whitespace").is_empty());
    }

    #[test]
    fn test_fixed_exact_boundaries() {
        let pieces = split_text(
            "abcdefghij",
            ChunkStrategy::Fixed {
                target_tokens: 1,
                overlap_tokens: 0,
            },
        )
        .expect("split");

        let contents: Vec<&str> = pieces.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["abcd", "efgh", "ij"]);
        let ordinals: Vec<u32> = pieces.iter().map(|p| p.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(pieces[1].start_char, 4);
        assert_eq!(pieces[1].end_char, 8);
    }

    #[test]
    fn test_fixed_overlap_repeats_previous_tail() {
        let pieces = split_text(
            "abcdefghijklmnop",
            ChunkStrategy::Fixed {
                target_tokens: 2,
                overlap_tokens: 1,
            },
        )
        .expect("split");

        assert_eq!(pieces[0].content, "abcdefgh");
        assert_eq!(pieces[1].content, "efghijklmnop");
        assert_eq!(pieces[1].start_char, 4);
        assert!(pieces[1].content.starts_with("efgh"), "overlap repeated at head");
    }

    #[test]
    fn test_fixed_reassembles_to_original() {
        let text = "The quick brown fox jumps over the lazy dog and keeps running.";
        let pieces = split_text(
            text,
            ChunkStrategy::Fixed {
                target_tokens: 3,
                overlap_tokens: 0,
            },
        )
        .expect("split");

        let rebuilt: String = pieces.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(rebuilt, text);

        for pair in pieces.windows(2) {
            assert_eq!(pair[0].ordinal + 1, pair[1].ordinal);
            assert_eq!(pair[0].end_char, pair[1].start_char);
        }
    }

    #[test]
    fn test_fixed_rejects_oversized_overlap() {
        let result = split_text(
            "whatever",
            ChunkStrategy::Fixed {
                target_tokens: 2,
                overlap_tokens: 2,
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_sliding_windows_and_stride() {
        let pieces = split_text(
            "abcdefghijkl",
            ChunkStrategy::Sliding {
                window_tokens: 2,
                stride_tokens: 1,
            },
        )
        .expect("split");

        let contents: Vec<&str> = pieces.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["abcdefgh", "efghijkl"]);
        assert_eq!(pieces[1].start_char, 4);
        assert_eq!(pieces[1].end_char, 12);
    }

    #[test]
    fn test_sliding_single_window_when_short() {
        let pieces = split_text(
            "short",
            ChunkStrategy::Sliding {
                window_tokens: 100,
                stride_tokens: 50,
            },
        )
        .expect("split");

        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].content, "short");
    }

    #[test]
    fn test_sliding_rejects_stride_not_below_window() {
        let result = split_text(
            "whatever",
            ChunkStrategy::Sliding {
                window_tokens: 2,
                stride_tokens: 2,
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_semantic_respects_paragraphs() {
        let text = "First paragraph about embeddings and retrieval quality.\n\n\
                    Second paragraph about chunking strategies for documents.";
        let pieces = split_text(
            text,
            ChunkStrategy::Semantic {
                min_tokens: 4,
                max_tokens: 16,
            },
        )
        .expect("split");

        assert!(pieces.len() >= 2, "paragraphs should not be glued together");
        assert!(pieces[0].content.contains("First paragraph"));
        assert!(pieces.iter().all(|p| (p.token_count as usize) <= 16));

        let ordinals: Vec<u32> = pieces.iter().map(|p| p.ordinal).collect();
        let expected: Vec<u32> = (0..pieces.len() as u32).collect();
        assert_eq!(ordinals, expected);
    }

    #[test]
    fn test_semantic_merges_small_trailing_fragment() {
        let text = "A sentence that is reasonably long for one chunk here. Tail.";
        let pieces = split_text(
            text,
            ChunkStrategy::Semantic {
                min_tokens: 8,
                max_tokens: 14,
            },
        )
        .expect("split");

        let last = pieces.last().expect("at least one piece");
        assert!(
            last.content.contains("Tail."),
            "short tail must be merged, not emitted alone: {pieces:?}"
        );
    }

    #[test]
    fn test_semantic_rejects_bad_bounds() {
        let result = split_text(
            "whatever",
            ChunkStrategy::Semantic {
                min_tokens: 10,
                max_tokens: 5,
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_strategy_from_settings() {
        let mut settings = ChunkingSettings::default();
        assert!(matches!(
            ChunkStrategy::from_settings(&settings).expect("semantic"),
            ChunkStrategy::Semantic { .. }
        ));

        settings.strategy = "fixed".to_string();
        assert!(matches!(
            ChunkStrategy::from_settings(&settings).expect("fixed"),
            ChunkStrategy::Fixed { .. }
        ));

        settings.strategy = "sliding".to_string();
        assert!(matches!(
            ChunkStrategy::from_settings(&settings).expect("sliding"),
            ChunkStrategy::Sliding { .. }
        ));

        settings.strategy = "mystery".to_string();
        assert!(ChunkStrategy::from_settings(&settings).is_err());
    }
}
