// src/retrieval/retriever.rs
// The context retriever: intent-driven hybrid search over the vector
// store, knowledge graph, documentation, and task logs, fused with RRF,
// filtered, gap-filled, and cached. Never returns an error to the caller;
// hard failures degrade to a stale cache entry or a synthetic item.

use crate::error::SibylError;
use crate::llm::{ExecuteOptions, TaskRouter, TaskType, json_repair};
use crate::prompts;
use crate::retrieval::analysis;
use crate::retrieval::cache::{ContextCache, cache_key};
use crate::retrieval::fusion::{dedup_items, merge_ranked, reciprocal_rank_fusion};
use crate::retrieval::types::{
    ContextItemType, ItemMetadata, RetrievalOptions, RetrievedContextItem,
};
use crate::retrieval::validate;
use crate::stores::{EmbeddingStore, KgNode, KnowledgeGraph, TaskLogStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Score assigned to direct entity-name lookups.
const DIRECT_LOOKUP_SCORE: f64 = 0.95;

/// Adaptive timeout parameters: base plus a per-expected-LLM-call slice,
/// capped at ten minutes.
const TIMEOUT_BASE: Duration = Duration::from_secs(120);
const TIMEOUT_PER_CALL: Duration = Duration::from_secs(15);
const TIMEOUT_CAP: Duration = Duration::from_secs(600);

pub struct ContextRetriever {
    router: Arc<TaskRouter>,
    embeddings: Arc<dyn EmbeddingStore>,
    graph: Arc<dyn KnowledgeGraph>,
    task_logs: Option<Arc<dyn TaskLogStore>>,
    cache: ContextCache,
}

impl ContextRetriever {
    pub fn new(
        router: Arc<TaskRouter>,
        embeddings: Arc<dyn EmbeddingStore>,
        graph: Arc<dyn KnowledgeGraph>,
    ) -> Self {
        Self {
            router,
            embeddings,
            graph,
            task_logs: None,
            cache: ContextCache::default(),
        }
    }

    /// Attach the optional task-log source.
    pub fn with_task_logs(mut self, task_logs: Arc<dyn TaskLogStore>) -> Self {
        self.task_logs = Some(task_logs);
        self
    }

    /// Estimated wall-clock budget for one retrieval: roughly ten LLM calls
    /// baseline, plus four for hybrid, three for KG, three for reranking.
    pub fn adaptive_timeout(options: &RetrievalOptions) -> Duration {
        let mut calls: u32 = 10;
        if options.use_hybrid {
            calls += 4;
        }
        if options.top_k_kg > 0 {
            calls += 3;
        }
        if options.enable_reranking {
            calls += 3;
        }
        (TIMEOUT_BASE + TIMEOUT_PER_CALL * calls).min(TIMEOUT_CAP)
    }

    /// Retrieve context for a prompt. Infallible: on wall-clock exhaustion
    /// or an uncaught pipeline error this returns the stale cache entry if
    /// one exists, else a single synthetic item describing the failure.
    pub async fn retrieve_context_for_prompt(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        self.retrieve_with_deadline(agent_id, prompt, options, Self::adaptive_timeout(options))
            .await
    }

    /// Same as `retrieve_context_for_prompt` with an explicit budget.
    pub async fn retrieve_with_deadline(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &RetrievalOptions,
        budget: Duration,
    ) -> Vec<RetrievedContextItem> {
        let key = cache_key(agent_id, prompt, options);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(agent_id, "Retrieval cache hit");
            return hit;
        }
        let stale = self.cache.get_stale(&key).await;

        let started = Instant::now();
        match tokio::time::timeout(budget, self.retrieve_inner(agent_id, prompt, options)).await {
            Ok(items) => {
                // Cache writes always succeed, even after partial source failures
                self.cache.insert(key, items.clone()).await;
                items
            }
            Err(_) => {
                let err = SibylError::WallClockExceeded {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                warn!(agent_id, error = %err, "Retrieval wall clock exhausted");
                match stale {
                    Some(items) => items,
                    None => vec![failure_item(&err)],
                }
            }
        }
    }

    /// Direct retrieval by entity names: knowledge-graph lookup first,
    /// optionally widened with per-name semantic search under hybrid mode.
    pub async fn retrieve_context_by_entity_names(
        &self,
        agent_id: &str,
        names: &[String],
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        let mut items = self.lookup_entities(agent_id, names).await;

        if options.use_hybrid {
            // Widen each name through the vector store concurrently
            let lookups = names
                .iter()
                .take(options.top_k_embeddings.max(1))
                .map(|name| async move {
                    match self
                        .embeddings
                        .retrieve_similar_code_chunks(agent_id, name, 2, None)
                        .await
                    {
                        Ok(chunks) => chunks,
                        Err(e) => {
                            warn!(agent_id, entity = %name, error = %e, "Semantic widening failed");
                            Vec::new()
                        }
                    }
                });
            for chunks in futures::future::join_all(lookups).await {
                items.extend(
                    chunks
                        .into_iter()
                        .filter(|c| c.score >= options.embedding_score_threshold)
                        .map(chunk_to_item),
                );
            }
        }

        let mut items = dedup_items(items);
        items.truncate(options.result_budget());
        items
    }

    /// The eleven-step pipeline. Individual source failures are isolated;
    /// this only returns what it could gather.
    async fn retrieve_inner(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        // Parallel analysis: intent classification + entity extraction
        let analysis = analysis::analyze_query(&self.router, prompt).await;
        info!(
            agent_id,
            intent = %analysis.intent,
            entities = analysis.entities.len(),
            "Query analysis complete"
        );

        // Direct entity lookup
        let direct = self.lookup_entities(agent_id, &analysis.entities).await;

        // Intent-weighted parallel source fan-out; a failing source
        // contributes an empty list and never aborts the others.
        let weights = analysis::intent_weights(analysis.intent);
        let semantic_k = scaled_k(weights.semantic, options.top_k_embeddings);
        let kg_k = scaled_k(weights.kg, options.top_k_kg);
        let doc_k = scaled_k(weights.doc, options.top_k_embeddings);
        let logs_k = scaled_k(weights.logs, 5);

        let (semantic, kg, doc, logs) = tokio::join!(
            self.semantic_source(agent_id, prompt, semantic_k, options),
            self.kg_source(agent_id, prompt, kg_k, options),
            self.doc_source(agent_id, prompt, doc_k, options),
            self.logs_source(agent_id, prompt, logs_k),
        );

        // Reciprocal rank fusion across all source lists
        let mut fused = reciprocal_rank_fusion(vec![direct, semantic, kg, doc, logs]);

        // Heuristic relevance validation, falling back to top-N by fused score
        let report = validate::validate_relevance(&fused, prompt, &analysis.entities);
        fused = if report.is_valid {
            report.valid_items
        } else {
            debug!(
                coverage = report.coverage,
                average = report.average,
                "Validation below threshold, keeping top fused results"
            );
            fused.truncate(options.result_budget());
            fused
        };

        // AI filter with retention floors
        if options.enable_reranking {
            fused = validate::ai_filter(
                &self.router,
                prompt,
                analysis.intent,
                fused,
                &options.target_file_paths,
            )
            .await;
        }

        // Gap fill: fetch definitions the context references but lacks
        let missing = self.missing_entities(prompt, &fused).await;
        if !missing.is_empty() {
            debug!(count = missing.len(), "Gap-filling missing entities");
            let extra = self.lookup_entities(agent_id, &missing).await;
            if !extra.is_empty() {
                fused = merge_ranked(fused, extra);
            }
        }

        // Proactive expansion: related entities worth having nearby
        let related = self.related_entities(prompt, &fused).await;
        if !related.is_empty() {
            let extra = self.lookup_entities(agent_id, &related).await;
            if !extra.is_empty() {
                fused = merge_ranked(fused, extra);
            }
        }

        // Dedup, truncate to budget, respect the character budget
        let mut result = dedup_items(fused);
        result.truncate(options.result_budget());
        if options.max_context_length > 0 {
            let mut total = 0usize;
            result.retain(|item| {
                let first = total == 0;
                total += item.content.chars().count();
                // Always keep the top item, even when it alone busts the budget
                first || total <= options.max_context_length
            });
        }
        result
    }

    /// `open_nodes` over unique names, scored 0.95 and flagged as direct.
    async fn lookup_entities(&self, agent_id: &str, names: &[String]) -> Vec<RetrievedContextItem> {
        if names.is_empty() {
            return Vec::new();
        }
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if !unique.contains(name) {
                unique.push(name.clone());
            }
        }
        match self.graph.open_nodes(agent_id, &unique).await {
            Ok(nodes) => nodes
                .into_iter()
                .map(|node| kg_node_to_item(node, DIRECT_LOOKUP_SCORE, true))
                .collect(),
            Err(e) => {
                warn!(agent_id, error = %e, "Direct entity lookup failed");
                Vec::new()
            }
        }
    }

    async fn semantic_source(
        &self,
        agent_id: &str,
        prompt: &str,
        top_k: usize,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        if top_k == 0 {
            return Vec::new();
        }
        let target_paths = if options.target_file_paths.is_empty() {
            None
        } else {
            Some(options.target_file_paths.as_slice())
        };
        match self
            .embeddings
            .retrieve_similar_code_chunks(agent_id, prompt, top_k, target_paths)
            .await
        {
            Ok(chunks) => chunks
                .into_iter()
                .filter(|c| c.score >= options.embedding_score_threshold)
                .map(chunk_to_item)
                .collect(),
            Err(e) => {
                warn!(agent_id, error = %e, "Semantic source failed");
                Vec::new()
            }
        }
    }

    /// Natural-language graph query; the NL-to-operation translation lives
    /// behind the collaborator. Scores decrease as 1/(rank+1).
    async fn kg_source(
        &self,
        agent_id: &str,
        prompt: &str,
        top_k: usize,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        if top_k == 0 || !options.use_hybrid {
            return Vec::new();
        }
        match self.graph.query_natural_language(agent_id, prompt).await {
            Ok(nodes) => nodes
                .into_iter()
                .take(top_k)
                .enumerate()
                .map(|(rank, node)| kg_node_to_item(node, 1.0 / (rank as f64 + 1.0), false))
                .collect(),
            Err(e) => {
                warn!(agent_id, error = %e, "Knowledge-graph source failed");
                Vec::new()
            }
        }
    }

    /// Documentation source: semantic hits narrowed to doc-shaped files.
    async fn doc_source(
        &self,
        agent_id: &str,
        prompt: &str,
        top_k: usize,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        if top_k == 0 {
            return Vec::new();
        }
        match self
            .embeddings
            .retrieve_similar_code_chunks(agent_id, prompt, top_k * 2, None)
            .await
        {
            Ok(chunks) => chunks
                .into_iter()
                .filter(|c| {
                    c.score >= options.embedding_score_threshold
                        && is_documentation_path(&c.file_path_relative)
                })
                .take(top_k)
                .map(|chunk| {
                    let mut item = chunk_to_item(chunk);
                    item.item_type = ContextItemType::Documentation;
                    item
                })
                .collect(),
            Err(e) => {
                warn!(agent_id, error = %e, "Documentation source failed");
                Vec::new()
            }
        }
    }

    /// Keyword match over the optional task-log store. Emits nothing when
    /// the store is absent.
    async fn logs_source(&self, agent_id: &str, prompt: &str, top_k: usize) -> Vec<RetrievedContextItem> {
        let Some(store) = &self.task_logs else {
            return Vec::new();
        };
        if top_k == 0 {
            return Vec::new();
        }
        let terms: Vec<String> = prompt
            .split_whitespace()
            .filter(|w| w.chars().count() > 3)
            .map(|w| w.to_lowercase())
            .collect();
        match store.get_logs_by_agent(agent_id, 50).await {
            Ok(logs) => logs
                .into_iter()
                .filter(|log| {
                    let haystack = format!("{} {}", log.title, log.body).to_lowercase();
                    terms.iter().any(|t| haystack.contains(t.as_str()))
                })
                .take(top_k)
                .enumerate()
                .map(|(rank, log)| {
                    let mut item = RetrievedContextItem::new(
                        ContextItemType::TaskLog,
                        log.task_id.clone(),
                        format!("{}\n{}", log.title, log.body),
                        1.0 / (rank as f64 + 1.0),
                    );
                    item.entity_name = Some(log.title);
                    item
                })
                .collect(),
            Err(e) => {
                warn!(agent_id, error = %e, "Task-log source failed");
                Vec::new()
            }
        }
    }

    /// Self-correction: ask which referenced entities have no definition in
    /// the current set.
    async fn missing_entities(
        &self,
        prompt: &str,
        items: &[RetrievedContextItem],
    ) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let rendered = prompts::GAP_ANALYSIS.render(&[
            ("query", prompt),
            ("items", &listing_for_prompt(items)),
        ]);
        let reply = match self
            .router
            .execute(
                TaskType::GapAnalysis,
                &rendered,
                Some(prompts::STATIC_PREFIX),
                ExecuteOptions::default(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Gap analysis unavailable");
                return Vec::new();
            }
        };
        let names = parse_string_array(&reply.content, "missing_entities");
        names
            .into_iter()
            .filter(|name| !items.iter().any(|i| i.entity_name.as_deref() == Some(name)))
            .take(5)
            .collect()
    }

    /// Proactive expansion: related entities worth pre-fetching.
    async fn related_entities(
        &self,
        prompt: &str,
        items: &[RetrievedContextItem],
    ) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let rendered = prompts::CONTEXT_EXPANSION.render(&[
            ("query", prompt),
            ("items", &listing_for_prompt(items)),
        ]);
        let reply = match self
            .router
            .execute(
                TaskType::ContextExpansion,
                &rendered,
                Some(prompts::STATIC_PREFIX),
                ExecuteOptions::default(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Context expansion unavailable");
                return Vec::new();
            }
        };
        parse_string_array(&reply.content, "related_entities")
            .into_iter()
            .filter(|name| !items.iter().any(|i| i.entity_name.as_deref() == Some(name)))
            .take(5)
            .collect()
    }
}

fn scaled_k(weight: f64, base: usize) -> usize {
    if weight <= 0.0 {
        return 0;
    }
    ((weight * base as f64 * 2.0).round() as usize).max(1)
}

fn chunk_to_item(chunk: crate::stores::CodeChunk) -> RetrievedContextItem {
    let item_type = chunk
        .metadata
        .kind
        .as_deref()
        .map(ContextItemType::from_entity_kind)
        .unwrap_or(ContextItemType::GenericCodeChunk);
    RetrievedContextItem {
        item_type,
        source_path: chunk.file_path_relative,
        entity_name: chunk.entity_name,
        content: chunk.chunk_text,
        relevance_score: chunk.score,
        metadata: ItemMetadata {
            start_line: chunk.metadata.start_line,
            end_line: chunk.metadata.end_line,
            language: chunk.metadata.language,
            ..Default::default()
        },
    }
}

fn kg_node_to_item(node: KgNode, score: f64, retrieved_by_name: bool) -> RetrievedContextItem {
    RetrievedContextItem {
        item_type: ContextItemType::KgNodeInfo,
        source_path: node.name.clone(),
        entity_name: Some(node.name),
        content: node.observations.join("\n"),
        relevance_score: score,
        metadata: ItemMetadata {
            kg_node_type: Some(node.entity_type),
            retrieved_by_name,
            ..Default::default()
        },
    }
}

fn is_documentation_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".md")
        || lower.ends_with(".rst")
        || lower.ends_with(".txt")
        || lower.contains("docs/")
        || lower.contains("readme")
}

/// Synthetic item returned when retrieval fails outright.
fn failure_item(err: &SibylError) -> RetrievedContextItem {
    RetrievedContextItem {
        item_type: ContextItemType::Documentation,
        source_path: "retrieval".into(),
        entity_name: None,
        content: format!("Context retrieval failed: {err}"),
        relevance_score: 0.0,
        metadata: ItemMetadata {
            retrieval_failure: true,
            error_type: Some(error_kind(err).into()),
            error_message: Some(err.to_string()),
            ..Default::default()
        },
    }
}

fn error_kind(err: &SibylError) -> &'static str {
    match err {
        SibylError::WallClockExceeded { .. } => "wall_clock_exceeded",
        SibylError::RateLimited { .. } => "rate_limited",
        SibylError::Timeout { .. } => "timeout",
        SibylError::AuthMissing { .. } | SibylError::CliMissing { .. } => "provider_unavailable",
        SibylError::TaskFailed { .. } => "task_failed",
        SibylError::RetrievalSource { .. } => "source_failure",
        _ => "internal",
    }
}

fn listing_for_prompt(items: &[RetrievedContextItem]) -> String {
    items
        .iter()
        .take(12)
        .map(|item| {
            let preview: String = item.content.chars().take(150).collect();
            format!(
                "- {} ({}): {}",
                item.entity_name.as_deref().unwrap_or(&item.source_path),
                item.item_type,
                preview.replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_string_array(reply: &str, field: &str) -> Vec<String> {
    json_repair::repair(reply)
        .and_then(|v| {
            v.get(field).and_then(Value::as_array).map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_k_zero_weight_disables_source() {
        assert_eq!(scaled_k(0.0, 10), 0);
    }

    #[test]
    fn test_scaled_k_minimum_one() {
        assert_eq!(scaled_k(0.01, 5), 1);
    }

    #[test]
    fn test_scaled_k_scales_with_weight() {
        assert_eq!(scaled_k(0.5, 10), 10);
        assert_eq!(scaled_k(0.3, 5), 3);
    }

    #[test]
    fn test_adaptive_timeout_defaults() {
        // 10 + 4 (hybrid) + 3 (kg) + 3 (rerank) = 20 calls → 120 + 300 = 420s
        let options = RetrievalOptions::default();
        assert_eq!(
            ContextRetriever::adaptive_timeout(&options),
            Duration::from_secs(420)
        );
    }

    #[test]
    fn test_adaptive_timeout_capped() {
        let options = RetrievalOptions::default();
        let timeout = ContextRetriever::adaptive_timeout(&options);
        assert!(timeout <= TIMEOUT_CAP);
    }

    #[test]
    fn test_adaptive_timeout_minimal_pipeline() {
        let options = RetrievalOptions {
            use_hybrid: false,
            enable_reranking: false,
            top_k_kg: 0,
            ..Default::default()
        };
        // 10 calls → 120 + 150 = 270s
        assert_eq!(
            ContextRetriever::adaptive_timeout(&options),
            Duration::from_secs(270)
        );
    }

    #[test]
    fn test_is_documentation_path() {
        assert!(is_documentation_path("README.md"));
        assert!(is_documentation_path("docs/guide.rst"));
        assert!(is_documentation_path("notes.TXT"));
        assert!(!is_documentation_path("src/main.rs"));
    }

    #[test]
    fn test_failure_item_metadata() {
        let err = SibylError::WallClockExceeded { elapsed_ms: 1000 };
        let item = failure_item(&err);
        assert_eq!(item.item_type, ContextItemType::Documentation);
        assert!(item.metadata.retrieval_failure);
        assert_eq!(item.metadata.error_type.as_deref(), Some("wall_clock_exceeded"));
        assert_eq!(item.relevance_score, 0.0);
    }

    #[test]
    fn test_parse_string_array() {
        let names = parse_string_array(r#"{"missing_entities": ["A", "", "B"]}"#, "missing_entities");
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
        assert!(parse_string_array("not json", "missing_entities").is_empty());
    }
}
