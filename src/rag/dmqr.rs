// src/rag/dmqr.rs
// Diverse multi-query rewriting: expand one developer question into a
// small set of strategy-tagged queries covering orthogonal angles.

use crate::llm::{ExecuteOptions, TaskRouter, TaskType, json_repair};
use crate::prompts;
use crate::stores::{KgNode, KnowledgeGraph};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MIN_QUERIES: usize = 2;
pub const MAX_QUERIES: usize = 5;

/// Which retrieval machinery a diverse query should run against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueryModality {
    Vector,
    Graph,
    #[default]
    Hybrid,
    Web,
}

/// One strategy-tagged rewrite of the original question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiverseQuery {
    pub text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub modality: QueryModality,
    #[serde(default)]
    pub complexity: String,
    #[serde(default)]
    pub expected_sources: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

/// The full query set plus the model's own coverage assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiverseQueryPlan {
    pub queries: Vec<DiverseQuery>,
    #[serde(default)]
    pub coverage_assessment: String,
}

/// Generate between two and five diverse queries. Falls back to a
/// deterministic two-query plan when the model misbehaves.
pub async fn generate_queries(
    router: &TaskRouter,
    query: &str,
    domain_context: &str,
    count: usize,
) -> DiverseQueryPlan {
    let count = count.clamp(MIN_QUERIES, MAX_QUERIES);
    let rendered = prompts::DIVERSE_QUERIES.render(&[
        ("count", &count.to_string()),
        ("query", query),
        ("domain_context", domain_context),
    ]);

    let reply = match router
        .execute(
            TaskType::DiverseQueryGeneration,
            &rendered,
            Some(prompts::STATIC_PREFIX),
            ExecuteOptions::default(),
        )
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "Diverse query generation failed, using fallback plan");
            return fallback_plan(query);
        }
    };

    let parsed = json_repair::repair(&reply.content)
        .and_then(|value| serde_json::from_value::<DiverseQueryPlan>(value).ok());

    match parsed {
        Some(mut plan) => {
            plan.queries.retain(|q| !q.text.trim().is_empty());
            plan.queries.truncate(count);
            for q in &mut plan.queries {
                q.priority = q.priority.clamp(1, 5);
            }
            if plan.queries.len() < MIN_QUERIES {
                debug!("Diverse query plan too small, using fallback plan");
                fallback_plan(query)
            } else {
                plan
            }
        }
        None => fallback_plan(query),
    }
}

/// Deterministic minimal plan: the question itself against both stores,
/// plus a relationship-angle rewrite for the graph.
fn fallback_plan(query: &str) -> DiverseQueryPlan {
    DiverseQueryPlan {
        queries: vec![
            DiverseQuery {
                text: query.to_string(),
                category: "implementation_deep_dive".into(),
                modality: QueryModality::Hybrid,
                complexity: "medium".into(),
                expected_sources: Vec::new(),
                priority: 5,
            },
            DiverseQuery {
                text: format!("components and relationships involved in: {query}"),
                category: "component_relationships".into(),
                modality: QueryModality::Graph,
                complexity: "medium".into(),
                expected_sources: Vec::new(),
                priority: 3,
            },
        ],
        coverage_assessment: "fallback plan: original query plus a relationship rewrite".into(),
    }
}

/// Run a knowledge-graph query through DMQR: issue every graph-capable
/// rewrite, then merge node results by `(name, entity_type)`, recording
/// which rewrite surfaced each node.
pub async fn graph_query_with_dmqr(
    router: &TaskRouter,
    graph: &dyn KnowledgeGraph,
    agent_id: &str,
    query: &str,
) -> Vec<KgNode> {
    let plan = generate_queries(router, query, "", 4).await;

    let mut merged: Vec<KgNode> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for dq in plan
        .queries
        .iter()
        .filter(|q| matches!(q.modality, QueryModality::Graph | QueryModality::Hybrid))
    {
        match graph.query_natural_language(agent_id, &dq.text).await {
            Ok(nodes) => {
                for mut node in nodes {
                    let key = (node.name.clone(), node.entity_type.clone());
                    if seen.insert(key) {
                        let label = if dq.category.is_empty() {
                            "query".to_string()
                        } else {
                            dq.category.clone()
                        };
                        node.observations.push(format!("retrieved_via: {label}"));
                        merged.push(node);
                    }
                }
            }
            Err(e) => {
                warn!(agent_id, category = %dq.category, error = %e, "DMQR graph query failed")
            }
        }
    }
    merged
}
