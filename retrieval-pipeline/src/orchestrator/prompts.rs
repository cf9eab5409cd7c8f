use super::QueryOptions;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a retrieval-grounded assistant. Answer the user's question using only the provided context. When the context does not contain the answer, say so instead of guessing. Be concise and factual.";

pub fn system_prompt(options: &QueryOptions) -> String {
    let mut prompt = options
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    if let Some(intent) = &options.intent {
        prompt.push_str(&format!("\nThe user's intent: {intent}."));
    }
    prompt
}

pub fn user_prompt(query: &str, context: &str) -> String {
    format!(
        "Retrieved excerpts, most relevant first:\n\n\
         {context}\n\n\
         Answer this question using only the excerpts above:\n\
         {query}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_override() {
        let default = system_prompt(&QueryOptions::default());
        assert_eq!(default, DEFAULT_SYSTEM_PROMPT);

        let custom = system_prompt(&QueryOptions {
            system_prompt: Some("be terse".to_string()),
            ..QueryOptions::default()
        });
        assert_eq!(custom, "be terse");
    }

    #[test]
    fn test_intent_is_woven_into_system_prompt() {
        let prompt = system_prompt(&QueryOptions {
            intent: Some("compare options".to_string()),
            ..QueryOptions::default()
        });
        assert!(prompt.contains("compare options"));
    }

    #[test]
    fn test_user_prompt_carries_both_parts() {
        let prompt = user_prompt("the question", "the context");
        assert!(prompt.contains("the question"));
        assert!(prompt.contains("the context"));
        assert!(prompt.contains("Retrieved excerpts"));
        assert!(
            prompt.find("the context") < prompt.find("the question"),
            "excerpts come before the question"
        );
    }
}
