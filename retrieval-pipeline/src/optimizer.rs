//! Pure query clean-up ahead of embedding: whitespace, punctuation, optional
//! acronym expansion and stopword removal, plus a diagnostic complexity
//! classification. No I/O.

use common::utils::{config::OptimizationSettings, text::collapse_whitespace};

/// Diagnostic complexity bucket; never changes retrieval behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryAnalysis {
    pub word_count: usize,
    pub sentence_count: usize,
    pub has_conjunctions: bool,
    pub complexity: QueryComplexity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedQuery {
    pub text: String,
    pub analysis: QueryAnalysis,
}

const ACRONYMS: &[(&str, &str)] = &[
    ("AI", "artificial intelligence (AI)"),
    ("ML", "machine learning (ML)"),
    ("NLP", "natural language processing (NLP)"),
    ("LLM", "large language model (LLM)"),
    ("RAG", "retrieval-augmented generation (RAG)"),
    ("API", "application programming interface (API)"),
    ("DB", "database (DB)"),
    ("SQL", "structured query language (SQL)"),
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "of", "in", "on", "at",
    "to", "for", "with", "it", "this", "that", "these", "those", "do", "does", "did", "what",
    "which", "who", "how",
];

const CONJUNCTIONS: &[&str] = &["and", "or", "but", "because", "although", "while", "whereas"];

fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '_'))
        .collect()
}

fn expand_acronyms(text: &str) -> String {
    let expanded: Vec<String> = text
        .split_whitespace()
        .map(|word| {
            ACRONYMS
                .iter()
                .find(|(acronym, _)| *acronym == word)
                .map_or_else(|| word.to_string(), |(_, expansion)| (*expansion).to_string())
        })
        .collect();
    expanded.join(" ")
}

fn remove_stopwords(text: &str) -> String {
    let kept: Vec<&str> = text
        .split_whitespace()
        .filter(|word| !STOPWORDS.contains(&word.to_lowercase().as_str()))
        .collect();
    kept.join(" ")
}

pub fn analyze(query: &str) -> QueryAnalysis {
    let word_count = query.split_whitespace().count();
    let sentence_count = query
        .split(['.', '!', '?'])
        .filter(|part| !part.trim().is_empty())
        .count()
        .max(usize::from(word_count > 0));
    let has_conjunctions = query
        .split_whitespace()
        .any(|word| CONJUNCTIONS.contains(&word.to_lowercase().as_str()));

    let base = match word_count {
        0..=5 => QueryComplexity::Simple,
        6..=12 => QueryComplexity::Moderate,
        13..=25 => QueryComplexity::Complex,
        _ => QueryComplexity::VeryComplex,
    };
    let complexity = if sentence_count > 1 || has_conjunctions {
        match base {
            QueryComplexity::Simple => QueryComplexity::Moderate,
            QueryComplexity::Moderate => QueryComplexity::Complex,
            _ => QueryComplexity::VeryComplex,
        }
    } else {
        base
    };

    QueryAnalysis {
        word_count,
        sentence_count,
        has_conjunctions,
        complexity,
    }
}

/// Clean a query for retrieval. Returns the original text whenever the
/// cleaned form would be too short to mean anything.
pub fn optimize(query: &str, settings: &OptimizationSettings) -> OptimizedQuery {
    let analysis = analyze(query);

    if !settings.enabled {
        return OptimizedQuery {
            text: query.to_string(),
            analysis,
        };
    }

    let mut text = collapse_whitespace(query);
    text = strip_punctuation(&text);
    text = collapse_whitespace(&text);

    if settings.expand_acronyms {
        text = expand_acronyms(&text);
    }
    if settings.remove_stopwords {
        text = remove_stopwords(&text);
    }

    if text.chars().count() < settings.min_length {
        return OptimizedQuery {
            text: query.to_string(),
            analysis,
        };
    }

    OptimizedQuery { text, analysis }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OptimizationSettings {
        OptimizationSettings::default()
    }

    #[test]
    fn test_trims_and_collapses_whitespace() {
        let result = optimize("  what   about\tembeddings  ", &settings());
        assert_eq!(result.text, "what about embeddings");
    }

    #[test]
    fn test_strips_punctuation_keeps_separators() {
        let result = optimize("chunk-size: how big, exactly?!", &settings());
        assert_eq!(result.text, "chunk-size how big exactly");
    }

    #[test]
    fn test_expands_known_acronyms() {
        let result = optimize("explain AI please", &settings());
        assert_eq!(result.text, "explain artificial intelligence (AI) please");
    }

    #[test]
    fn test_acronym_must_match_case() {
        let result = optimize("the ai lab", &settings());
        assert_eq!(result.text, "the ai lab", "lowercase 'ai' is a word, not the acronym");
    }

    #[test]
    fn test_acronym_expansion_disabled() {
        let disabled = OptimizationSettings {
            expand_acronyms: false,
            ..settings()
        };
        let result = optimize("explain AI please", &disabled);
        assert_eq!(result.text, "explain AI please");
    }

    #[test]
    fn test_stopword_removal_opt_in() {
        let with_stopwords = optimize("what is the meaning of retrieval", &settings());
        assert_eq!(with_stopwords.text, "what is the meaning of retrieval");

        let enabled = OptimizationSettings {
            remove_stopwords: true,
            ..settings()
        };
        let without = optimize("what is the meaning of retrieval", &enabled);
        assert_eq!(without.text, "meaning retrieval");
    }

    #[test]
    fn test_short_result_returns_original() {
        let enabled = OptimizationSettings {
            remove_stopwords: true,
            ..settings()
        };
        let result = optimize("is it?", &enabled);
        assert_eq!(result.text, "is it?", "never degrade to a meaningless stub");
    }

    #[test]
    fn test_disabled_optimizer_passthrough() {
        let disabled = OptimizationSettings {
            enabled: false,
            ..settings()
        };
        let result = optimize("  messy   query?? ", &disabled);
        assert_eq!(result.text, "  messy   query?? ");
    }

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(analyze("what is rust").complexity, QueryComplexity::Simple);
        assert_eq!(
            analyze("how do lifetimes interact with borrowing in rust generics").complexity,
            QueryComplexity::Moderate
        );
        assert_eq!(
            analyze("compare rust and go for systems work").complexity,
            QueryComplexity::Complex,
            "conjunction bumps a moderate query"
        );
        let long = "word ".repeat(30);
        assert_eq!(analyze(&long).complexity, QueryComplexity::VeryComplex);
    }

    #[test]
    fn test_analysis_counts_sentences() {
        let analysis = analyze("First part. Second part? Third!");
        assert_eq!(analysis.sentence_count, 3);
        assert_eq!(analyze("").sentence_count, 0);
    }
}
