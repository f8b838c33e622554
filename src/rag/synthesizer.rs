// src/rag/synthesizer.rs
// Answer synthesis with hard citation rules: every claim cites a numbered
// source, and a citation index outside [1, total_sources] is an invariant
// violation that is reported, never silently dropped.

use crate::error::Result;
use crate::llm::{ExecuteOptions, TaskRouter, TaskType};
use crate::prompts;
use crate::retrieval::RetrievedContextItem;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

static CITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[cite_(\d+)\]").unwrap_or_else(|_| unreachable!("static regex"))
});

/// Minimum fraction of sources an answer should use.
pub const MIN_SOURCE_UTILIZATION: f64 = 0.5;

/// One resolved citation in a synthesized answer.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub n: usize,
    pub source_path: String,
    pub entity_name: Option<String>,
    pub confidence: f64,
}

/// A synthesized answer with its citation audit.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisOutcome {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Citation-bound violations, utilization warnings, etc.
    pub issues: Vec<String>,
    pub used_sources: usize,
    pub total_sources: usize,
}

impl SynthesisOutcome {
    /// The zero-source answer: explicit, citation-free.
    pub fn insufficient_context(query: &str) -> Self {
        Self {
            text: format!(
                "Insufficient context: no sources could be retrieved for this question.\n\n\
                 Question: {query}\n\n\
                 Try narrowing the question to specific files or entity names, or confirm \
                 the codebase has been indexed for this agent."
            ),
            citations: Vec::new(),
            issues: vec!["insufficient_context".into()],
            used_sources: 0,
            total_sources: 0,
        }
    }
}

/// Generate the citation-bearing answer from the retrieved context.
pub async fn synthesize_answer(
    router: &TaskRouter,
    query: &str,
    items: &[RetrievedContextItem],
) -> Result<SynthesisOutcome> {
    if items.is_empty() {
        return Ok(SynthesisOutcome::insufficient_context(query));
    }

    let sources = numbered_sources(items);
    let total = items.len();
    let rendered = prompts::ANSWER_SYNTHESIS.render(&[
        ("query", query),
        ("sources", &sources),
        ("total_sources", &total.to_string()),
    ]);

    let reply = router
        .execute(
            TaskType::AnswerSynthesis,
            &rendered,
            Some(prompts::STATIC_PREFIX),
            ExecuteOptions {
                timeout: Duration::from_secs(120),
                ..Default::default()
            },
        )
        .await?;

    let (citations, mut issues) = audit_citations(&reply.content, items);
    let used = citations.len();
    let utilization = used as f64 / total as f64;
    if utilization < MIN_SOURCE_UTILIZATION {
        issues.push(format!(
            "low_source_utilization: {used} of {total} sources cited"
        ));
    }

    Ok(SynthesisOutcome {
        text: reply.content,
        citations,
        issues,
        used_sources: used,
        total_sources: total,
    })
}

/// Extract `[cite_N]` markers, resolve in-range ones against the source
/// list, and report out-of-range ones (including the forbidden `[cite_0]`).
pub fn audit_citations(
    text: &str,
    items: &[RetrievedContextItem],
) -> (Vec<Citation>, Vec<String>) {
    let total = items.len();
    let mut citations: Vec<Citation> = Vec::new();
    let mut issues: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<usize> = std::collections::HashSet::new();

    for capture in CITE_RE.captures_iter(text) {
        let Some(n) = capture.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
            continue;
        };
        if n == 0 || n > total {
            let issue = format!("invalid citation [cite_{n}] (valid range 1..={total})");
            if !issues.contains(&issue) {
                issues.push(issue);
            }
            continue;
        }
        if seen.insert(n) {
            let item = &items[n - 1];
            citations.push(Citation {
                n,
                source_path: item.source_path.clone(),
                entity_name: item.entity_name.clone(),
                confidence: item.relevance_score.clamp(0.0, 1.0),
            });
        }
    }

    citations.sort_by_key(|c| c.n);
    (citations, issues)
}

/// Render sources as the numbered list the synthesis prompt expects.
fn numbered_sources(items: &[RetrievedContextItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let entity = item
                .entity_name
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            let content: String = item.content.chars().take(800).collect();
            format!("[{}] {}{}\n{}", i + 1, item.source_path, entity, content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
