// src/retrieval/validate.rs
// Two-stage result filtering: a deterministic relevance heuristic, then an
// AI filter with minimum-retention floors.

use crate::llm::{ExecuteOptions, TaskRouter, TaskType, json_repair};
use crate::prompts;
use crate::retrieval::types::{QueryIntent, RetrievedContextItem};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Keep an item when its heuristic score reaches this.
const ITEM_THRESHOLD: f64 = 0.5;

/// Overall validity needs coverage * average at least this.
const VALIDITY_THRESHOLD: f64 = 0.4;

/// Content markers that suggest a definition rather than prose.
const STRUCTURAL_KEYWORDS: [&str; 9] = [
    "class", "function", "interface", "struct", "enum", "trait", "impl", "fn ", "def ",
];

/// Outcome of the heuristic validation pass.
#[derive(Debug)]
pub struct ValidationReport {
    /// Items that passed the per-item threshold, original order.
    pub valid_items: Vec<RetrievedContextItem>,
    /// Fraction of input items that passed.
    pub coverage: f64,
    /// Mean heuristic score of the passing items.
    pub average: f64,
    pub is_valid: bool,
}

/// Score each item against the prompt: direct term match (0.4), path
/// relevance (0.3), entity-name match (0.3), plus a 0.2 bonus for
/// structurally-shaped content.
pub fn validate_relevance(
    items: &[RetrievedContextItem],
    prompt: &str,
    entities: &[String],
) -> ValidationReport {
    let terms: Vec<String> = prompt
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() > 3)
        .map(|w| w.to_lowercase())
        .collect();

    let mut valid_items = Vec::new();
    let mut score_sum = 0.0;
    for item in items {
        let score = item_score(item, &terms, entities);
        if score >= ITEM_THRESHOLD {
            score_sum += score;
            valid_items.push(item.clone());
        }
    }

    let coverage = if items.is_empty() {
        0.0
    } else {
        valid_items.len() as f64 / items.len() as f64
    };
    let average = if valid_items.is_empty() {
        0.0
    } else {
        score_sum / valid_items.len() as f64
    };
    let is_valid = !valid_items.is_empty() && coverage * average >= VALIDITY_THRESHOLD;

    ValidationReport {
        valid_items,
        coverage,
        average,
        is_valid,
    }
}

fn item_score(item: &RetrievedContextItem, terms: &[String], entities: &[String]) -> f64 {
    let content_lower = item.content.to_lowercase();
    let path_lower = item.source_path.to_lowercase();

    let term_fraction = if terms.is_empty() {
        0.0
    } else {
        let matched = terms.iter().filter(|t| content_lower.contains(t.as_str())).count();
        matched as f64 / terms.len() as f64
    };
    let mut score = term_fraction * 0.4;

    if terms.iter().any(|t| path_lower.contains(t.as_str())) {
        score += 0.3;
    }

    let entity_hit = entities.iter().any(|e| {
        let e_lower = e.to_lowercase();
        item.entity_name
            .as_deref()
            .map(|n| n.to_lowercase().contains(&e_lower))
            .unwrap_or(false)
            || content_lower.contains(&e_lower)
            || path_lower.contains(&e_lower)
    });
    if entity_hit {
        score += 0.3;
    }

    if STRUCTURAL_KEYWORDS.iter().any(|k| content_lower.contains(k)) {
        score += 0.2;
    }

    score
}

/// Ask a fast model which items matter, then enforce the retention floor:
/// explanation intents keep at least 70%, everything else at least 50%.
/// Items from explicitly targeted files are never all dropped.
pub async fn ai_filter(
    router: &TaskRouter,
    prompt: &str,
    intent: QueryIntent,
    items: Vec<RetrievedContextItem>,
    target_paths: &[String],
) -> Vec<RetrievedContextItem> {
    if items.is_empty() {
        return items;
    }

    let listing = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                "[{i}] ({}) {}: {}",
                item.item_type,
                item.source_path,
                preview(&item.content, 200)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let rendered = prompts::CONTEXT_FILTER.render(&[
        ("query", prompt),
        ("intent", &intent.to_string()),
        ("items", &listing),
    ]);

    let reply = match router
        .execute(
            TaskType::ContextFiltering,
            &rendered,
            Some(prompts::STATIC_PREFIX),
            ExecuteOptions::default(),
        )
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "AI filter unavailable, keeping all items");
            return items;
        }
    };

    let Some(indices) = parse_indices(&reply.content, items.len()) else {
        debug!("AI filter reply unparseable, keeping all items");
        return items;
    };

    let selected: HashSet<usize> = indices.into_iter().collect();
    let mut kept: Vec<usize> = (0..items.len()).filter(|i| selected.contains(i)).collect();

    // Retention floor: the filter may trim noise, not gut the context.
    let floor_fraction = if intent.is_explanatory() { 0.7 } else { 0.5 };
    let floor = ((items.len() as f64) * floor_fraction).ceil() as usize;
    if kept.len() < floor {
        for i in 0..items.len() {
            if kept.len() >= floor {
                break;
            }
            if !kept.contains(&i) {
                kept.push(i);
            }
        }
        kept.sort_unstable();
    }

    // Explicitly targeted files must survive the filter.
    if !target_paths.is_empty() {
        let kept_has_target = kept
            .iter()
            .any(|&i| target_paths.iter().any(|p| items[i].source_path.contains(p.as_str())));
        if !kept_has_target {
            for (i, item) in items.iter().enumerate() {
                if target_paths.iter().any(|p| item.source_path.contains(p.as_str()))
                    && !kept.contains(&i)
                {
                    kept.push(i);
                }
            }
            kept.sort_unstable();
        }
    }

    let keep: HashSet<usize> = kept.into_iter().collect();
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, item)| item)
        .collect()
}

fn parse_indices(reply: &str, len: usize) -> Option<Vec<usize>> {
    let value = json_repair::repair(reply)?;
    let array = value.get("relevant_indices")?.as_array()?;
    Some(
        array
            .iter()
            .filter_map(Value::as_u64)
            .map(|i| i as usize)
            .filter(|&i| i < len)
            .collect(),
    )
}

fn preview(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        flat.chars().take(max).collect()
    }
}
