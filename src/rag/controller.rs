// src/rag/controller.rs
// The bounded agentic loop: plan each turn with the RAG-analysis prompt,
// retrieve, merge, reflect, and terminate under deterministic guardrails
// that no model output can override.

use crate::llm::{ExecuteOptions, TaskRouter, TaskType, json_repair};
use crate::prompts;
use crate::rag::dmqr;
use crate::rag::synthesizer::{self, Citation};
use crate::rag::verifier;
use crate::retrieval::{
    ContextItemType, ContextRetriever, QueryIntent, RetrievalOptions, RetrievedContextItem,
    dedup_items, intent_aspects, merge_ranked,
};
use crate::stores::WebSearch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

// Deterministic termination guardrails (independent of the planning model)
const QUALITY_ANSWER_NOW: f64 = 0.8;
const QUALITY_LATE_ANSWER: f64 = 0.7;
const LATE_TURN: u32 = 3;
const SOURCE_SATURATION: usize = 10;
const QUALITY_SATURATED: f64 = 0.6;

/// What the controller does next.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Answer,
    SearchAgain,
    HybridSearch,
    SearchWeb,
    CorrectiveSearch,
    Reflect,
}

/// How much machinery `answer` brings to bear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// One retrieval, one synthesis.
    Simple,
    /// DMQR-seeded iterative loop.
    Enhanced,
    /// Iterative loop with web search allowed.
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    pub enable_verification: bool,
    /// Diverse queries requested when seeding the loop.
    pub dmqr_queries: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            enable_verification: true,
            dmqr_queries: 3,
        }
    }
}

/// Append-only record of one plan–retrieve–reflect cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub turn_no: u32,
    pub decision: Decision,
    pub strategy: String,
    pub query_issued: Option<String>,
    pub items_added: usize,
    pub quality_before: f64,
    pub quality_after: f64,
    pub citation_coverage: f64,
    pub gaps: Vec<String>,
}

/// The final grounded answer.
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub turn_log: Vec<TurnRecord>,
    pub issues: Vec<String>,
    /// Set only when the controller could not produce a grounded result.
    pub error: Option<String>,
}

/// Parsed output of the RAG-analysis prompt, with lenient defaults.
#[derive(Debug, Clone)]
struct TurnPlan {
    decision: Decision,
    strategy: String,
    next_query: String,
    quality: Option<f64>,
    missing_information: Vec<String>,
}

pub struct RagController {
    router: Arc<TaskRouter>,
    retriever: Arc<ContextRetriever>,
    web: Option<Arc<dyn WebSearch>>,
    config: ControllerConfig,
}

impl RagController {
    pub fn new(
        router: Arc<TaskRouter>,
        retriever: Arc<ContextRetriever>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            router,
            retriever,
            web: None,
            config,
        }
    }

    pub fn with_web_search(mut self, web: Arc<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    /// Answer a developer question. Never panics and never surfaces a bare
    /// error for missing context: failures come back inside the `error`
    /// field with a best-effort partial answer.
    pub async fn answer(
        &self,
        agent_id: &str,
        query: &str,
        mode: AnswerMode,
        options: &RetrievalOptions,
    ) -> RagAnswer {
        match mode {
            AnswerMode::Simple => self.answer_simple(agent_id, query, options).await,
            AnswerMode::Enhanced | AnswerMode::Hybrid => {
                self.answer_iterative(agent_id, query, mode, options).await
            }
        }
    }

    async fn answer_simple(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> RagAnswer {
        let intent = lexical_intent(query);
        let items = self
            .retriever
            .retrieve_context_for_prompt(agent_id, query, options)
            .await;
        let quality = quality_score(&items, intent);
        let turn = TurnRecord {
            turn_no: 1,
            decision: Decision::Answer,
            strategy: "single_pass".into(),
            query_issued: Some(query.to_string()),
            items_added: items.len(),
            quality_before: 0.0,
            quality_after: quality,
            citation_coverage: citation_coverage(&items),
            gaps: Vec::new(),
        };
        self.finish(agent_id, query, items, vec![turn], None).await
    }

    async fn answer_iterative(
        &self,
        agent_id: &str,
        query: &str,
        mode: AnswerMode,
        options: &RetrievalOptions,
    ) -> RagAnswer {
        let intent = lexical_intent(query);
        let web_allowed = mode == AnswerMode::Hybrid
            && self.web.is_some()
            && !is_codebase_introspection(query);

        // DMQR seeds the first turn with its highest-priority rewrite.
        let plan = dmqr::generate_queries(&self.router, query, "", self.config.dmqr_queries).await;
        let seed_query = plan
            .queries
            .iter()
            .max_by_key(|q| q.priority)
            .map(|q| q.text.clone())
            .unwrap_or_else(|| query.to_string());
        debug!(coverage = %plan.coverage_assessment, "DMQR seed plan ready");

        let mut context: Vec<RetrievedContextItem> = Vec::new();
        let mut turn_log: Vec<TurnRecord> = Vec::new();
        let mut gaps: Vec<String> = Vec::new();
        let mut history: Vec<String> = Vec::new();

        for turn in 1..=self.config.max_iterations {
            let quality_before = quality_score(&context, intent);

            // Turn 1 always executes the seed search; later turns plan.
            let turn_plan = if turn == 1 {
                TurnPlan {
                    decision: Decision::SearchAgain,
                    strategy: "dmqr_seed".into(),
                    next_query: seed_query.clone(),
                    quality: None,
                    missing_information: Vec::new(),
                }
            } else {
                self.plan_turn(query, turn, &context, quality_before, &history, &gaps)
                    .await
            };

            let current_quality = turn_plan.quality.unwrap_or(quality_before);
            let decision = apply_guardrails(
                turn_plan.decision,
                current_quality,
                turn,
                context.len(),
                self.config.max_iterations,
            );

            if decision == Decision::Answer {
                turn_log.push(TurnRecord {
                    turn_no: turn,
                    decision,
                    strategy: turn_plan.strategy,
                    query_issued: None,
                    items_added: 0,
                    quality_before,
                    quality_after: quality_before,
                    citation_coverage: citation_coverage(&context),
                    gaps: gaps.clone(),
                });
                break;
            }

            let (new_items, query_issued, strategy) = self
                .act(
                    agent_id,
                    query,
                    &turn_plan,
                    decision,
                    web_allowed,
                    &history,
                    &context,
                    options,
                )
                .await;

            let before_len = context.len();
            context = dedup_items(merge_ranked(context, new_items));
            let items_added = context.len().saturating_sub(before_len);
            let quality_after = quality_score(&context, intent);

            // Gaps: what the plan flagged missing, minus what we now hold
            gaps = turn_plan
                .missing_information
                .iter()
                .filter(|name| !context_mentions(&context, name))
                .cloned()
                .collect();

            if let Some(q) = &query_issued {
                history.push(q.clone());
            }
            info!(
                turn,
                decision = %decision,
                items_added,
                quality = quality_after,
                "Turn complete"
            );
            turn_log.push(TurnRecord {
                turn_no: turn,
                decision,
                strategy,
                query_issued,
                items_added,
                quality_before,
                quality_after,
                citation_coverage: citation_coverage(&context),
                gaps: gaps.clone(),
            });
        }

        self.finish(agent_id, query, context, turn_log, Some(options)).await
    }

    /// Execute one non-answer decision and return the new items, the query
    /// actually issued, and the strategy label for the turn record.
    #[allow(clippy::too_many_arguments)]
    async fn act(
        &self,
        agent_id: &str,
        query: &str,
        plan: &TurnPlan,
        decision: Decision,
        web_allowed: bool,
        history: &[String],
        context: &[RetrievedContextItem],
        options: &RetrievalOptions,
    ) -> (Vec<RetrievedContextItem>, Option<String>, String) {
        let fallback_query = if plan.next_query.trim().is_empty() {
            query.to_string()
        } else {
            plan.next_query.clone()
        };

        match decision {
            Decision::Answer => (Vec::new(), None, plan.strategy.clone()),
            Decision::Reflect => {
                // Reflection costs no external call; the adjusted strategy
                // shows up in the next planning turn.
                (Vec::new(), None, "reflect".into())
            }
            Decision::SearchWeb => {
                if web_allowed {
                    let results = match &self.web {
                        Some(web) => match web.search(&fallback_query).await {
                            Ok(results) => results,
                            Err(e) => {
                                warn!(error = %e, "Web search failed");
                                Vec::new()
                            }
                        },
                        None => Vec::new(),
                    };
                    let items = results
                        .into_iter()
                        .enumerate()
                        .map(|(rank, r)| {
                            let mut item = RetrievedContextItem::new(
                                ContextItemType::Documentation,
                                r.url,
                                format!("{}\n{}", r.title, r.snippet),
                                1.0 / (rank as f64 + 1.0),
                            );
                            item.entity_name = Some(r.title);
                            item
                        })
                        .collect();
                    (items, Some(fallback_query), "web_search".into())
                } else {
                    // Codebase-introspection questions never go to the web
                    let items = self
                        .retriever
                        .retrieve_context_for_prompt(agent_id, &fallback_query, options)
                        .await;
                    (items, Some(fallback_query), "web_downgraded_to_search".into())
                }
            }
            Decision::CorrectiveSearch => {
                let improved = self
                    .corrective_query(query, history, context)
                    .await
                    .unwrap_or_else(|| fallback_query.clone());
                let items = self
                    .retriever
                    .retrieve_context_for_prompt(agent_id, &improved, options)
                    .await;
                (items, Some(improved), "corrective_search".into())
            }
            Decision::SearchAgain | Decision::HybridSearch => {
                let items = self
                    .retriever
                    .retrieve_context_for_prompt(agent_id, &fallback_query, options)
                    .await;
                let strategy = if plan.strategy.is_empty() {
                    decision.to_string().to_lowercase()
                } else {
                    plan.strategy.clone()
                };
                (items, Some(fallback_query), strategy)
            }
        }
    }

    /// Run the RAG-analysis prompt and parse its JSON plan leniently.
    async fn plan_turn(
        &self,
        query: &str,
        turn: u32,
        context: &[RetrievedContextItem],
        quality: f64,
        history: &[String],
        gaps: &[String],
    ) -> TurnPlan {
        let summary = context_summary(context);
        let rendered = prompts::RAG_ANALYSIS.render(&[
            ("query", query),
            ("turn", &turn.to_string()),
            ("max_turns", &self.config.max_iterations.to_string()),
            ("context_summary", &summary),
            ("quality", &format!("{quality:.2}")),
            ("history", &history.join(" | ")),
            ("gaps", &gaps.join(", ")),
        ]);

        let reply = match self
            .router
            .execute(
                TaskType::RagAnalysis,
                &rendered,
                Some(prompts::STATIC_PREFIX),
                ExecuteOptions::default(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Turn planning failed, retrying retrieval with original query");
                return TurnPlan {
                    decision: Decision::SearchAgain,
                    strategy: "planning_unavailable".into(),
                    next_query: query.to_string(),
                    quality: None,
                    missing_information: Vec::new(),
                };
            }
        };

        parse_turn_plan(&reply.content, query)
    }

    /// Self-correction prompt: analyze the failed retrieval, get one
    /// improved query.
    async fn corrective_query(
        &self,
        query: &str,
        history: &[String],
        context: &[RetrievedContextItem],
    ) -> Option<String> {
        let failed = history.last().cloned().unwrap_or_else(|| query.to_string());
        let rendered = prompts::CORRECTIVE_SEARCH.render(&[
            ("query", query),
            ("failed_query", &failed),
            ("summary", &context_summary(context)),
        ]);
        let reply = self
            .router
            .execute(
                TaskType::CorrectiveAnalysis,
                &rendered,
                Some(prompts::STATIC_PREFIX),
                ExecuteOptions::default(),
            )
            .await
            .ok()?;
        json_repair::repair(&reply.content)
            .and_then(|v| {
                v.get("improved_query")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|q| !q.trim().is_empty())
    }

    /// Synthesize, optionally verify, and assemble the final answer object.
    async fn finish(
        &self,
        agent_id: &str,
        query: &str,
        mut context: Vec<RetrievedContextItem>,
        mut turn_log: Vec<TurnRecord>,
        options: Option<&RetrievalOptions>,
    ) -> RagAnswer {
        let mut outcome = match synthesizer::synthesize_answer(&self.router, query, &context).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Synthesis failed");
                return RagAnswer {
                    text: partial_answer_text(&context),
                    citations: Vec::new(),
                    turn_log,
                    issues: Vec::new(),
                    error: Some(format!("synthesis_failed: {e}")),
                };
            }
        };

        let mut issues = outcome.issues.clone();

        if self.config.enable_verification && outcome.total_sources > 0 {
            let citation_issues: Vec<String> = issues
                .iter()
                .filter(|i| i.contains("invalid citation"))
                .cloned()
                .collect();
            let report = verifier::verify_answer(
                &self.router,
                query,
                &outcome.text,
                &context,
                &citation_issues,
            )
            .await;

            if !report.passed() {
                let turns_used = turn_log.len() as u32;
                let can_correct =
                    options.is_some() && turns_used < self.config.max_iterations;
                if can_correct {
                    // One corrective iteration, still within the turn bound
                    if let Some(options) = options {
                        let corrected = self
                            .run_correction_turn(agent_id, query, &mut context, &mut turn_log, options)
                            .await;
                        if corrected {
                            match synthesizer::synthesize_answer(&self.router, query, &context)
                                .await
                            {
                                Ok(new_outcome) => {
                                    outcome = new_outcome;
                                    issues = outcome.issues.clone();
                                }
                                Err(e) => warn!(error = %e, "Corrective synthesis failed"),
                            }
                        }
                    }
                } else {
                    outcome.text.push_str(
                        "\n\n## Limitations\n\nVerification scored parts of this answer below \
                         threshold; treat uncited details with care.",
                    );
                }
                issues.extend(report.issues.clone());
            }
        }

        let error = if outcome.total_sources == 0 {
            Some("insufficient_context".into())
        } else {
            None
        };

        RagAnswer {
            text: outcome.text,
            citations: outcome.citations,
            turn_log,
            issues,
            error,
        }
    }

    /// Verification-triggered corrective turn. Returns true when new
    /// context was added.
    async fn run_correction_turn(
        &self,
        agent_id: &str,
        query: &str,
        context: &mut Vec<RetrievedContextItem>,
        turn_log: &mut Vec<TurnRecord>,
        options: &RetrievalOptions,
    ) -> bool {
        let history: Vec<String> = turn_log.iter().filter_map(|t| t.query_issued.clone()).collect();
        let improved = self
            .corrective_query(query, &history, context)
            .await
            .unwrap_or_else(|| query.to_string());
        let intent = lexical_intent(query);
        let quality_before = quality_score(context, intent);

        let new_items = self
            .retriever
            .retrieve_context_for_prompt(agent_id, &improved, options)
            .await;
        let before_len = context.len();
        *context = dedup_items(merge_ranked(std::mem::take(context), new_items));
        let items_added = context.len().saturating_sub(before_len);

        turn_log.push(TurnRecord {
            turn_no: turn_log.last().map(|t| t.turn_no + 1).unwrap_or(1),
            decision: Decision::CorrectiveSearch,
            strategy: "verification_correction".into(),
            query_issued: Some(improved),
            items_added,
            quality_before,
            quality_after: quality_score(context, intent),
            citation_coverage: citation_coverage(context),
            gaps: Vec::new(),
        });
        items_added > 0
    }
}

/// The canonical quality model:
/// `0.5·avg(relevance) + 0.3·aspect_coverage + 0.2·citation_coverage`.
pub fn quality_score(items: &[RetrievedContextItem], intent: QueryIntent) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let avg: f64 = items
        .iter()
        .map(|i| i.relevance_score.clamp(0.0, 1.0))
        .sum::<f64>()
        / items.len() as f64;

    let aspects = intent_aspects(intent);
    let haystack: String = items
        .iter()
        .map(|i| i.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let covered = aspects.iter().filter(|a| haystack.contains(*a)).count();
    let coverage = covered as f64 / aspects.len() as f64;

    0.5 * avg + 0.3 * coverage + 0.2 * citation_coverage(items)
}

/// Fraction of the context that is citation-targetable: distinct source
/// paths over item count.
pub fn citation_coverage(items: &[RetrievedContextItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let distinct: std::collections::HashSet<&str> =
        items.iter().map(|i| i.source_path.as_str()).collect();
    distinct.len() as f64 / items.len() as f64
}

/// Deterministic post-check over the model's decision. Quality thresholds
/// and the turn bound always win.
pub fn apply_guardrails(
    llm_decision: Decision,
    current_quality: f64,
    turn: u32,
    source_count: usize,
    max_iterations: u32,
) -> Decision {
    if current_quality >= QUALITY_ANSWER_NOW {
        return Decision::Answer;
    }
    if current_quality >= QUALITY_LATE_ANSWER && turn >= LATE_TURN {
        return Decision::Answer;
    }
    if source_count >= SOURCE_SATURATION && current_quality >= QUALITY_SATURATED {
        return Decision::Answer;
    }
    if turn >= max_iterations {
        return Decision::Answer;
    }
    llm_decision
}

/// Questions about the indexed codebase itself never route to the web.
pub fn is_codebase_introspection(query: &str) -> bool {
    let q = query.to_lowercase();
    ["this codebase", "this repo", "this project", "our code", "in the code", "src/"]
        .iter()
        .any(|marker| q.contains(marker))
}

fn context_mentions(context: &[RetrievedContextItem], name: &str) -> bool {
    let lower = name.to_lowercase();
    context.iter().any(|item| {
        item.entity_name
            .as_deref()
            .map(|e| e.to_lowercase() == lower)
            .unwrap_or(false)
            || item.content.to_lowercase().contains(&lower)
    })
}

fn context_summary(context: &[RetrievedContextItem]) -> String {
    if context.is_empty() {
        return "(no context gathered yet)".into();
    }
    context
        .iter()
        .take(10)
        .map(|item| {
            let preview: String = item.content.chars().take(120).collect();
            format!(
                "- {} [{}]: {}",
                item.source_path,
                item.item_type,
                preview.replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn partial_answer_text(context: &[RetrievedContextItem]) -> String {
    if context.is_empty() {
        return "No answer could be produced: synthesis failed and no context was available."
            .into();
    }
    let listing = context
        .iter()
        .take(10)
        .map(|i| format!("- {}", i.source_path))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "No answer could be synthesized, but the following context was retrieved and may help:\n{listing}"
    )
}

fn parse_turn_plan(reply: &str, original_query: &str) -> TurnPlan {
    let value = json_repair::repair(reply);
    let Some(value) = value else {
        return TurnPlan {
            decision: Decision::SearchAgain,
            strategy: "unparseable_plan".into(),
            next_query: original_query.to_string(),
            quality: None,
            missing_information: Vec::new(),
        };
    };

    let decision = value
        .get("decision")
        .and_then(Value::as_str)
        .and_then(|s| s.trim().to_uppercase().parse::<Decision>().ok())
        .unwrap_or(Decision::SearchAgain);

    TurnPlan {
        decision,
        strategy: value
            .get("strategy")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        next_query: value
            .get("next_query")
            .and_then(Value::as_str)
            .unwrap_or(original_query)
            .to_string(),
        quality: value.get("quality").and_then(Value::as_f64).map(|q| q.clamp(0.0, 1.0)),
        missing_information: value
            .get("missing_information")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Cheap lexical intent detection for quality scoring; the retriever runs
/// the real LLM classification internally.
pub fn lexical_intent(query: &str) -> QueryIntent {
    let q = query.to_lowercase();
    if q.contains("example") || q.contains("usage of") || q.contains("how to use") {
        return QueryIntent::FindExample;
    }
    if q.contains("refactor") || q.contains("restructure") || q.contains("clean up") {
        return QueryIntent::RefactorCode;
    }
    if q.contains("error") || q.contains("bug") || q.contains("panic") || q.contains("fix") {
        return QueryIntent::DebugError;
    }
    if q.contains("implement") || q.contains("add support") || q.contains("new feature") {
        return QueryIntent::AddFeature;
    }
    if q.contains("how does") || q.contains("explain") || q.contains("what is") || q.contains("why")
    {
        return QueryIntent::UnderstandCode;
    }
    QueryIntent::GeneralQuery
}
