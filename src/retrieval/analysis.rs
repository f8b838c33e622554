// src/retrieval/analysis.rs
// Query analysis: intent classification and entity extraction run in
// parallel on small models, with deterministic fallbacks. The intent
// weight matrix decides how much each retrieval source contributes.

use crate::llm::{ExecuteOptions, TaskRouter, TaskType, json_repair};
use crate::prompts;
use crate::retrieval::types::QueryIntent;
use serde_json::Value;
use tracing::debug;

/// Outcome of the parallel query analysis step.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub intent: QueryIntent,
    pub entities: Vec<String>,
}

/// Per-source contribution weights for one intent.
/// Order of concerns: semantic, knowledge graph, documentation, task logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceWeights {
    pub semantic: f64,
    pub kg: f64,
    pub doc: f64,
    pub logs: f64,
}

/// Fixed intent → weights matrix. A weight of zero means the source is
/// not queried at all for that intent.
pub fn intent_weights(intent: QueryIntent) -> SourceWeights {
    match intent {
        QueryIntent::FindExample => SourceWeights {
            semantic: 0.5,
            kg: 0.2,
            doc: 0.2,
            logs: 0.1,
        },
        QueryIntent::RefactorCode => SourceWeights {
            semantic: 0.4,
            kg: 0.4,
            doc: 0.1,
            logs: 0.1,
        },
        QueryIntent::DebugError => SourceWeights {
            semantic: 0.4,
            kg: 0.3,
            doc: 0.1,
            logs: 0.2,
        },
        QueryIntent::AddFeature => SourceWeights {
            semantic: 0.4,
            kg: 0.3,
            doc: 0.2,
            logs: 0.1,
        },
        QueryIntent::UnderstandCode => SourceWeights {
            semantic: 0.4,
            kg: 0.3,
            doc: 0.3,
            logs: 0.0,
        },
        QueryIntent::GeneralQuery => SourceWeights {
            semantic: 0.5,
            kg: 0.3,
            doc: 0.1,
            logs: 0.1,
        },
    }
}

/// Aspects a good answer should touch per intent; used by the controller's
/// coverage term of the quality score.
pub fn intent_aspects(intent: QueryIntent) -> &'static [&'static str] {
    match intent {
        QueryIntent::FindExample => &["example", "usage", "call"],
        QueryIntent::RefactorCode => &["structure", "dependency", "impl"],
        QueryIntent::DebugError => &["error", "cause", "handler"],
        QueryIntent::AddFeature => &["interface", "impl", "config"],
        QueryIntent::UnderstandCode => &["definition", "flow", "purpose"],
        QueryIntent::GeneralQuery => &["definition", "usage"],
    }
}

/// Classify intent and extract entities concurrently. Both calls are
/// best-effort: on any failure the intent defaults to `general_query` and
/// entities fall back to the regex tokenizer.
pub async fn analyze_query(router: &TaskRouter, prompt: &str) -> QueryAnalysis {
    let (intent, entities) = tokio::join!(
        classify_intent(router, prompt),
        extract_entities(router, prompt)
    );
    QueryAnalysis { intent, entities }
}

async fn classify_intent(router: &TaskRouter, prompt: &str) -> QueryIntent {
    let rendered = prompts::INTENT_CLASSIFICATION.render(&[("query", prompt)]);
    let result = router
        .execute(
            TaskType::IntentClassification,
            &rendered,
            Some(prompts::STATIC_PREFIX),
            ExecuteOptions::default(),
        )
        .await;
    match result {
        Ok(reply) => {
            let label = json_repair::repair(&reply.content)
                .and_then(|v| v.get("intent").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| reply.content.trim().to_string());
            QueryIntent::parse(&label)
        }
        Err(e) => {
            debug!(error = %e, "Intent classification failed, defaulting to general_query");
            QueryIntent::GeneralQuery
        }
    }
}

async fn extract_entities(router: &TaskRouter, prompt: &str) -> Vec<String> {
    let rendered = prompts::ENTITY_EXTRACTION.render(&[("query", prompt)]);
    let result = router
        .execute(
            TaskType::KeywordExtraction,
            &rendered,
            Some(prompts::STATIC_PREFIX),
            ExecuteOptions::default(),
        )
        .await;
    let extracted = result.ok().and_then(|reply| {
        let value = json_repair::repair(&reply.content)?;
        let entities = value.get("entities")?.as_array()?;
        let names: Vec<String> = entities
            .iter()
            .filter_map(|e| e.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() { None } else { Some(names) }
    });
    match extracted {
        Some(names) => unique_preserving_order(names),
        None => fallback_entities(prompt),
    }
}

/// Deterministic fallback: identifier-shaped words longer than 3 chars,
/// minus common English filler.
pub fn fallback_entities(prompt: &str) -> Vec<String> {
    const STOPWORDS: [&str; 18] = [
        "what", "when", "where", "which", "does", "this", "that", "with", "from", "have", "will",
        "should", "could", "about", "there", "their", "them", "then",
    ];
    let words = prompt
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() > 3)
        .filter(|w| !STOPWORDS.contains(&w.to_lowercase().as_str()))
        .map(str::to_string)
        .collect();
    unique_preserving_order(words)
}

fn unique_preserving_order(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_weights_defined_for_every_intent() {
        for intent in QueryIntent::iter() {
            let w = intent_weights(intent);
            let sum = w.semantic + w.kg + w.doc + w.logs;
            assert!((sum - 1.0).abs() < 1e-9, "weights for {intent} sum to {sum}");
            assert!(w.semantic > 0.0, "semantic is never disabled");
        }
    }

    #[test]
    fn test_understand_code_disables_logs() {
        assert_eq!(intent_weights(QueryIntent::UnderstandCode).logs, 0.0);
    }

    #[test]
    fn test_aspects_nonempty() {
        for intent in QueryIntent::iter() {
            assert!(!intent_aspects(intent).is_empty());
        }
    }

    #[test]
    fn test_fallback_entities_basic() {
        let entities = fallback_entities("How does the UserService handle auth_token renewal?");
        assert!(entities.contains(&"UserService".to_string()));
        assert!(entities.contains(&"auth_token".to_string()));
        assert!(entities.contains(&"renewal".to_string()));
        // "does" is a stopword, "the" is too short
        assert!(!entities.contains(&"does".to_string()));
        assert!(!entities.contains(&"the".to_string()));
    }

    #[test]
    fn test_fallback_entities_dedup_preserves_order() {
        let entities = fallback_entities("Parser calls Parser again via parse_loop");
        assert_eq!(
            entities,
            vec!["Parser".to_string(), "calls".to_string(), "again".to_string(), "parse_loop".to_string()]
        );
    }
}
