//! Integration tests for the sibyl pipeline: routing, retrieval, the
//! iterative controller, and citation handling, driven end-to-end against
//! scripted LLM clients and in-memory stores.


use sibyl::llm::{ExecuteOptions, GEMINI_FLASH_LITE, TaskRouter, TaskType};
use sibyl::rag::{AnswerMode, ControllerConfig, Decision, HALLUCINATION_DETECTED};
use sibyl::retrieval::{
    ContextItemType, ContextRetriever, QueryIntent, RetrievalOptions, RetrievedContextItem,
    ai_filter,
};
use sibyl::{Sibyl, SibylError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use test_utils::*;

async fn build_engine(
    llm: Arc<ScriptedLlm>,
    embeddings: Arc<StaticEmbeddings>,
    graph: Arc<StaticGraph>,
    config: ControllerConfig,
) -> Sibyl {
    init_tracing();
    Sibyl::builder()
        .registry(gemini_registry(llm))
        .embeddings(embeddings)
        .knowledge_graph(graph)
        .controller_config(config)
        .build()
        .await
        .expect("engine builds")
}

// ============================================================================
// Scenario: simple JSON extraction through the router
// ============================================================================

#[tokio::test]
async fn test_simple_json_extraction_uses_simple_model() {
    let llm = Arc::new(ScriptedLlm {
        fallback_reply: "Sure:\n```json\n{\"name\": \"John\", \"age\": 30}\n```".into(),
        ..Default::default()
    });
    let router = TaskRouter::new(gemini_registry(llm));

    let result = router
        .execute(
            TaskType::JsonExtraction,
            r#"Extract {"name","age"} from "John is 30""#,
            None,
            ExecuteOptions::default(),
        )
        .await
        .expect("extraction succeeds");

    assert_eq!(result.model_used, GEMINI_FLASH_LITE);
    let value: serde_json::Value = serde_json::from_str(&result.content).expect("valid JSON out");
    assert_eq!(value["name"], "John");
    assert_eq!(value["age"], 30);

    let stats = router.stats_for(GEMINI_FLASH_LITE).expect("stats recorded");
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failure, 0);
}

// ============================================================================
// Scenario: retrieval where only the knowledge graph has answers
// ============================================================================

#[tokio::test]
async fn test_retrieval_with_kg_hits_only() {
    let llm = Arc::new(ScriptedLlm::default());
    let router = Arc::new(TaskRouter::new(gemini_registry(llm)));
    let graph = Arc::new(StaticGraph::new(vec![
        node(
            "UserService",
            "class",
            &["class UserService defined in src/user_service.rs", "handles user sessions"],
        ),
        node(
            "UserServiceConfig",
            "struct",
            &["struct holding UserService settings"],
        ),
    ]));
    let retriever = ContextRetriever::new(router, Arc::new(StaticEmbeddings::empty()), graph);

    let items = retriever
        .retrieve_context_for_prompt(
            "agent-1",
            "How does UserService handle sessions?",
            &RetrievalOptions::default(),
        )
        .await;

    assert_eq!(items.len(), 2, "both KG nodes expected: {items:?}");
    for item in &items {
        assert_eq!(item.item_type, ContextItemType::KgNodeInfo);
        assert!(item.relevance_score > 0.0);
    }
    let paths: Vec<&str> = items.iter().map(|i| i.source_path.as_str()).collect();
    assert!(paths.contains(&"UserService"));
    assert!(paths.contains(&"UserServiceConfig"));
}

// ============================================================================
// Scenario: iterative controller terminates early on reported quality
// ============================================================================

#[tokio::test]
async fn test_enhanced_answer_early_termination() {
    let llm = Arc::new(ScriptedLlm::default());
    // Turn 2 planning reports quality 0.85: the guardrail must force ANSWER
    llm.queue_plan(r#"{"decision": "SEARCH_AGAIN", "strategy": "assess", "quality": 0.85}"#);

    let embeddings = Arc::new(StaticEmbeddings::new(vec![chunk(
        "src/loop.rs",
        Some("run_loop"),
        "fn run_loop() { /* definition and usage of the loop */ }",
        0.9,
    )]));
    let engine = build_engine(
        llm,
        embeddings,
        Arc::new(StaticGraph::empty()),
        ControllerConfig {
            max_iterations: 5,
            enable_verification: false,
            dmqr_queries: 3,
        },
    )
    .await;

    let answer = engine
        .answer(
            "agent-1",
            "how does the run loop work?",
            AnswerMode::Enhanced,
            &RetrievalOptions::default(),
        )
        .await;

    assert_eq!(answer.turn_log.len(), 2, "turn log: {:?}", answer.turn_log);
    assert_eq!(answer.turn_log[1].decision, Decision::Answer);
    assert!(answer.error.is_none());
    assert_eq!(answer.citations.len(), 1);
    assert!(answer.text.contains("[cite_1]"));
}

// ============================================================================
// Scenario: out-of-range citation is flagged, never silently dropped
// ============================================================================

#[tokio::test]
async fn test_citation_out_of_range_flagged() {
    let llm = Arc::new(ScriptedLlm {
        synthesis_reply: "The loop lives in main.rs [cite_4].".into(),
        ..Default::default()
    });
    let embeddings = Arc::new(StaticEmbeddings::new(vec![
        chunk("src/main.rs", Some("main"), "fn main loop iteration", 0.9),
        chunk("src/driver.rs", Some("drive"), "fn drive the main loop", 0.85),
        chunk("src/tick.rs", Some("tick"), "fn tick main loop step", 0.8),
    ]));
    let engine = build_engine(
        llm,
        embeddings,
        Arc::new(StaticGraph::empty()),
        ControllerConfig {
            max_iterations: 3,
            enable_verification: true,
            dmqr_queries: 3,
        },
    )
    .await;

    let answer = engine
        .answer(
            "agent-1",
            "Where is the main loop?",
            AnswerMode::Simple,
            &RetrievalOptions::default(),
        )
        .await;

    assert!(
        answer.issues.iter().any(|i| i.contains("[cite_4]")),
        "issues: {:?}",
        answer.issues
    );
    assert!(
        answer
            .issues
            .iter()
            .any(|i| i.contains(HALLUCINATION_DETECTED)),
        "issues: {:?}",
        answer.issues
    );
    assert!(answer.citations.is_empty());
    assert!(answer.text.contains("Limitations"));
}

// ============================================================================
// Cache determinism
// ============================================================================

#[tokio::test]
async fn test_identical_retrievals_hit_cache() {
    let llm = Arc::new(ScriptedLlm::default());
    let embeddings = Arc::new(StaticEmbeddings::new(vec![chunk(
        "src/session.rs",
        Some("Session"),
        "struct Session definition and usage for session handling",
        0.9,
    )]));
    let router = Arc::new(TaskRouter::new(gemini_registry(llm.clone())));
    let retriever = ContextRetriever::new(
        router,
        embeddings.clone(),
        Arc::new(StaticGraph::empty()),
    );

    let options = RetrievalOptions::default();
    let first = retriever
        .retrieve_context_for_prompt("agent-1", "explain session handling", &options)
        .await;
    let llm_calls_after_first = llm.call_count();
    let store_calls_after_first = embeddings.calls.load(Ordering::SeqCst);

    let second = retriever
        .retrieve_context_for_prompt("agent-1", "explain session handling", &options)
        .await;

    assert_eq!(first, second, "cache hit must be byte-identical");
    assert_eq!(llm.call_count(), llm_calls_after_first, "no LLM calls on cache hit");
    assert_eq!(
        embeddings.calls.load(Ordering::SeqCst),
        store_calls_after_first,
        "no store calls on cache hit"
    );
}

// ============================================================================
// Intent weights: a zero-weight source is never queried
// ============================================================================

#[tokio::test]
async fn test_zero_weight_source_not_called() {
    // Default intent reply is understand_code, whose task-log weight is 0
    let llm = Arc::new(ScriptedLlm::default());
    let router = Arc::new(TaskRouter::new(gemini_registry(llm)));
    let logs = Arc::new(CountingLogs::new(Vec::new()));
    let retriever = ContextRetriever::new(
        router,
        Arc::new(StaticEmbeddings::empty()),
        Arc::new(StaticGraph::empty()),
    )
    .with_task_logs(logs.clone());

    let _ = retriever
        .retrieve_context_for_prompt(
            "agent-1",
            "explain the scheduler",
            &RetrievalOptions::default(),
        )
        .await;

    assert_eq!(
        logs.calls.load(Ordering::SeqCst),
        0,
        "zero-weight task-log source must not be queried"
    );
}

// ============================================================================
// AI filter: explicitly targeted files survive
// ============================================================================

#[tokio::test]
async fn test_target_paths_reincluded_after_filter() {
    // The filter keeps only indices 0 and 1; index 3 is the targeted file
    let llm = Arc::new(ScriptedLlm {
        filter_reply: r#"{"relevant_indices": [0, 1]}"#.into(),
        ..Default::default()
    });
    let router = TaskRouter::new(gemini_registry(llm));

    let items: Vec<RetrievedContextItem> = [
        ("src/a.rs", "fn a"),
        ("src/b.rs", "fn b"),
        ("src/c.rs", "fn c"),
        ("src/target.rs", "fn target"),
    ]
    .iter()
    .map(|(path, content)| {
        RetrievedContextItem::new(ContextItemType::FileSnippet, *path, *content, 0.6)
    })
    .collect();

    let target_paths = vec!["src/target.rs".to_string()];
    let kept = ai_filter(
        &router,
        "fix the bug in target",
        QueryIntent::DebugError,
        items,
        &target_paths,
    )
    .await;

    assert!(
        kept.iter().any(|i| i.source_path == "src/target.rs"),
        "targeted file must survive the filter: {kept:?}"
    );
}

// ============================================================================
// Zero sources: explicit insufficient-context answer
// ============================================================================

#[tokio::test]
async fn test_zero_sources_yields_insufficient_context() {
    let llm = Arc::new(ScriptedLlm::default());
    let engine = build_engine(
        llm,
        Arc::new(StaticEmbeddings::empty()),
        Arc::new(StaticGraph::empty()),
        ControllerConfig {
            max_iterations: 3,
            enable_verification: true,
            dmqr_queries: 2,
        },
    )
    .await;

    let answer = engine
        .answer(
            "agent-1",
            "describe the frobnicator",
            AnswerMode::Simple,
            &RetrievalOptions::default(),
        )
        .await;

    assert_eq!(answer.error.as_deref(), Some("insufficient_context"));
    assert!(answer.citations.is_empty());
    assert!(answer.text.contains("Insufficient context"));
    assert!(!answer.text.contains("[cite_"));
}

// ============================================================================
// Web search is refused for codebase introspection
// ============================================================================

#[tokio::test]
async fn test_web_search_downgraded_for_introspection_queries() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.queue_plan(
        r#"{"decision": "SEARCH_WEB", "strategy": "look outside", "next_query": "loop docs", "quality": 0.2}"#,
    );

    let embeddings = Arc::new(StaticEmbeddings::new(vec![chunk(
        "src/loop.rs",
        Some("run_loop"),
        "fn run_loop() { /* definition and usage */ }",
        0.9,
    )]));
    let engine = build_engine(
        llm,
        embeddings,
        Arc::new(StaticGraph::empty()),
        ControllerConfig {
            max_iterations: 3,
            enable_verification: false,
            dmqr_queries: 2,
        },
    )
    .await;
    // Note: no web collaborator attached, and the query names the codebase

    let answer = engine
        .answer(
            "agent-1",
            "how does the loop in this codebase work?",
            AnswerMode::Hybrid,
            &RetrievalOptions::default(),
        )
        .await;

    let downgraded = answer
        .turn_log
        .iter()
        .find(|t| t.strategy == "web_downgraded_to_search");
    assert!(
        downgraded.is_some(),
        "introspection query must not reach the web: {:?}",
        answer.turn_log
    );
    assert!(answer.error.is_none());
}

// ============================================================================
// Controller always terminates within the iteration bound
// ============================================================================

#[tokio::test]
async fn test_controller_terminates_at_max_iterations() {
    let llm = Arc::new(ScriptedLlm::default());
    // Every planning turn stubbornly asks for another search at low quality
    for _ in 0..5 {
        llm.queue_plan(r#"{"decision": "SEARCH_AGAIN", "strategy": "dig", "quality": 0.1}"#);
    }
    let engine = build_engine(
        llm,
        Arc::new(StaticEmbeddings::new(vec![chunk(
            "src/a.rs",
            Some("a"),
            "fn a() {}",
            0.9,
        )])),
        Arc::new(StaticGraph::empty()),
        ControllerConfig {
            max_iterations: 3,
            enable_verification: false,
            dmqr_queries: 2,
        },
    )
    .await;

    let answer = engine
        .answer(
            "agent-1",
            "keep digging forever",
            AnswerMode::Enhanced,
            &RetrievalOptions::default(),
        )
        .await;

    assert_eq!(answer.turn_log.len(), 3, "turn log: {:?}", answer.turn_log);
    assert_eq!(
        answer.turn_log.last().map(|t| t.decision),
        Some(Decision::Answer),
        "the turn bound must force an answer"
    );
}

// ============================================================================
// Wall-clock exhaustion degrades to a synthetic failure item
// ============================================================================

#[tokio::test]
async fn test_wall_clock_exhaustion_returns_synthetic_item() {
    let llm = Arc::new(ScriptedLlm::default());
    let router = Arc::new(TaskRouter::new(gemini_registry(llm)));
    let retriever = ContextRetriever::new(
        router,
        Arc::new(SlowEmbeddings {
            delay: std::time::Duration::from_secs(5),
        }),
        Arc::new(StaticGraph::empty()),
    );

    let items = retriever
        .retrieve_with_deadline(
            "agent-1",
            "anything at all",
            &RetrievalOptions::default(),
            std::time::Duration::from_millis(20),
        )
        .await;

    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.item_type, ContextItemType::Documentation);
    assert!(item.metadata.retrieval_failure);
    assert_eq!(
        item.metadata.error_type.as_deref(),
        Some("wall_clock_exceeded")
    );
    assert!(item.metadata.error_message.is_some());
}

// ============================================================================
// DMQR graph mode merges node results across rewrites
// ============================================================================

#[tokio::test]
async fn test_dmqr_graph_queries_merge_by_identity() {
    let llm = Arc::new(ScriptedLlm {
        dmqr_reply: r#"{
            "queries": [
                {"text": "UserService structure", "category": "architectural_overview", "modality": "graph", "priority": 4},
                {"text": "UserService data flow", "category": "data_flow", "modality": "hybrid", "priority": 3},
                {"text": "session docs", "category": "configuration", "modality": "web", "priority": 1}
            ],
            "coverage_assessment": "structure, flow, and docs"
        }"#
        .into(),
        ..Default::default()
    });
    let router = TaskRouter::new(gemini_registry(llm));
    let graph = StaticGraph::new(vec![node(
        "UserService",
        "class",
        &["defined in src/user_service.rs"],
    )]);

    let merged = sibyl::rag::graph_query_with_dmqr(&router, &graph, "agent-1", "UserService").await;

    // Two graph-capable rewrites hit the same node; it must appear once
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].name, "UserService");
    assert!(
        merged[0]
            .observations
            .iter()
            .any(|o| o.starts_with("retrieved_via:")),
        "provenance expected: {:?}",
        merged[0].observations
    );
    // The web-modality query never touches the graph
    assert_eq!(graph.calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Direct retrieval by entity names
// ============================================================================

#[tokio::test]
async fn test_retrieve_context_by_entity_names() {
    let llm = Arc::new(ScriptedLlm::default());
    let router = Arc::new(TaskRouter::new(gemini_registry(llm)));
    let graph = Arc::new(StaticGraph::new(vec![node(
        "TokenStore",
        "struct",
        &["struct TokenStore in src/auth/tokens.rs"],
    )]));
    let embeddings = Arc::new(StaticEmbeddings::new(vec![chunk(
        "src/auth/tokens.rs",
        Some("TokenStore"),
        "impl TokenStore { fn refresh(&mut self) {} }",
        0.9,
    )]));
    let retriever = ContextRetriever::new(router, embeddings, graph);

    let items = retriever
        .retrieve_context_by_entity_names(
            "agent-1",
            &["TokenStore".to_string()],
            &RetrievalOptions::default(),
        )
        .await;

    let kg_item = items
        .iter()
        .find(|i| i.item_type == ContextItemType::KgNodeInfo)
        .expect("direct KG lookup expected");
    assert!(kg_item.metadata.retrieved_by_name);
    assert_eq!(kg_item.source_path, "TokenStore");
    assert!((kg_item.relevance_score - 0.95).abs() < 1e-9);
    assert!(
        items
            .iter()
            .any(|i| i.source_path == "src/auth/tokens.rs"),
        "hybrid widening should add the code chunk: {items:?}"
    );
}

// ============================================================================
// All providers unavailable surfaces a structured failure
// ============================================================================

#[tokio::test]
async fn test_no_models_available_is_task_failed() {
    let registry = Arc::new(sibyl::ModelRegistry::with_clients(
        Vec::new(),
        std::collections::HashMap::new(),
    ));
    let router = TaskRouter::new(registry);
    let err = router
        .execute(TaskType::ShortSummary, "summarize", None, ExecuteOptions::default())
        .await
        .expect_err("no models must fail");
    match err {
        SibylError::TaskFailed { reason, .. } => assert_eq!(reason, "no_available_models"),
        other => panic!("unexpected error: {other}"),
    }
}
