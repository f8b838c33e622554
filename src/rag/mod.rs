// src/rag/mod.rs
// Agentic RAG: diverse query rewriting, the iterative controller, and
// answer synthesis with verification

mod controller;
pub mod dmqr;
mod synthesizer;
mod verifier;

pub use controller::{
    AnswerMode, ControllerConfig, Decision, RagAnswer, RagController, TurnRecord,
    apply_guardrails, citation_coverage, is_codebase_introspection, lexical_intent, quality_score,
};
pub use dmqr::{DiverseQuery, DiverseQueryPlan, QueryModality, generate_queries, graph_query_with_dmqr};
pub use synthesizer::{
    Citation, MIN_SOURCE_UTILIZATION, SynthesisOutcome, audit_citations, synthesize_answer,
};
pub use verifier::{
    HALLUCINATION_DETECTED, VERIFICATION_THRESHOLD, VerificationReport, verify_answer,
};
