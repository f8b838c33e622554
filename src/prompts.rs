// src/prompts.rs
// Versioned prompt templates. Substitution is a pure function; templates
// never reach providers with an unfilled placeholder unless the caller
// chose to leave one in.

/// A named, versioned prompt template with `{placeholder}` slots.
pub struct PromptTemplate {
    pub name: &'static str,
    pub version: u32,
    pub text: &'static str,
}

impl PromptTemplate {
    /// Substitute `{key}` slots with the given values. Unknown keys in the
    /// template are left untouched, which keeps literal JSON braces safe.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        render(self.text, vars)
    }
}

/// Pure placeholder substitution over any template text.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Shared prefix for every sibyl prompt, kept identical across calls so
/// providers can reuse their KV cache.
pub const STATIC_PREFIX: &str = "You are a codebase analysis engine. Ground every statement in the \
supplied context, never invent code entities, and reply in exactly the format requested.";

pub static INTENT_CLASSIFICATION: PromptTemplate = PromptTemplate {
    name: "intent_classification",
    version: 3,
    text: r#"Classify the developer question into exactly one intent.

Question: {query}

Intents:
- find_example: looking for usage examples or call sites
- refactor_code: restructuring existing code
- debug_error: diagnosing an error, panic, or wrong behavior
- add_feature: implementing something new
- understand_code: asking how or why code works
- general_query: anything else

Reply with JSON only: {"intent": "<one of the six>"}"#,
};

pub static ENTITY_EXTRACTION: PromptTemplate = PromptTemplate {
    name: "entity_extraction",
    version: 2,
    text: r#"Extract the code entities (types, functions, modules, files, config keys)
mentioned or implied by this question. Keep original casing.

Question: {query}

Reply with JSON only: {"entities": ["Name", "other_name"]}"#,
};

pub static CONTEXT_FILTER: PromptTemplate = PromptTemplate {
    name: "context_filter",
    version: 2,
    text: r#"A developer asked: {query}
Intent: {intent}

Below are numbered context items. Select the ones actually useful for
answering; prefer keeping definitions the answer would cite.

{items}

Reply with JSON only: {"relevant_indices": [0, 2]}"#,
};

pub static GAP_ANALYSIS: PromptTemplate = PromptTemplate {
    name: "gap_analysis",
    version: 2,
    text: r#"Question: {query}

Context items gathered so far:
{items}

List code entities that are referenced by the context but whose definition
is missing from it. Only name entities that plausibly exist in the codebase.

Reply with JSON only: {"missing_entities": ["Name"]}"#,
};

pub static CONTEXT_EXPANSION: PromptTemplate = PromptTemplate {
    name: "context_expansion",
    version: 1,
    text: r#"Question: {query}

Context items gathered so far:
{items}

Suggest up to five additional related entities (callers, callees, sibling
types, config) that would strengthen the answer.

Reply with JSON only: {"related_entities": ["Name"]}"#,
};

pub static DIVERSE_QUERIES: PromptTemplate = PromptTemplate {
    name: "diverse_queries",
    version: 4,
    text: r#"Rewrite one developer question into {count} complementary search queries
that together cover orthogonal angles of the codebase: architectural
overview, component relationships, implementation deep-dive, data flow,
error handling, performance, security, configuration. Skip angles that do
not apply.

Question: {query}
Domain context: {domain_context}

Each query carries the modality it should run against: "vector" for
semantic similarity, "graph" for knowledge-graph traversal, "hybrid" for
both, "web" for external documentation.

Reply with JSON only:
{
  "queries": [
    {
      "text": "...",
      "category": "architectural_overview",
      "modality": "vector",
      "complexity": "medium",
      "expected_sources": ["src/auth"],
      "priority": 3
    }
  ],
  "coverage_assessment": "one sentence on what the set collectively covers"
}"#,
};

pub static RAG_ANALYSIS: PromptTemplate = PromptTemplate {
    name: "rag_analysis",
    version: 5,
    text: r#"You are steering an iterative retrieval loop over a codebase index.

Original question: {query}
Turn: {turn} of {max_turns}
Context summary so far:
{context_summary}
Quality so far: {quality}
Search history: {history}
Known gaps: {gaps}

Decide the next action. Allowed decisions: ANSWER, SEARCH_AGAIN,
HYBRID_SEARCH, SEARCH_WEB, CORRECTIVE_SEARCH, REFLECT.

Reply with JSON only:
{
  "decision": "SEARCH_AGAIN",
  "strategy": "short label",
  "reasoning": "one or two sentences",
  "next_query": "the query to run if searching",
  "quality": 0.0,
  "missing_information": ["entity or aspect"],
  "citation_targets": ["path or entity worth citing"],
  "confidence": 0.0,
  "fallback_strategy": "what to do if this fails"
}"#,
};

pub static CORRECTIVE_SEARCH: PromptTemplate = PromptTemplate {
    name: "corrective_search",
    version: 2,
    text: r#"The previous retrieval for this question returned weak results.

Question: {query}
Failed query: {failed_query}
What came back: {summary}

Analyze why the retrieval failed (wrong terms, too broad, wrong entity
names) and produce one improved query.

Reply with JSON only: {"failure_analysis": "...", "improved_query": "..."}"#,
};

pub static ANSWER_SYNTHESIS: PromptTemplate = PromptTemplate {
    name: "answer_synthesis",
    version: 6,
    text: r#"Answer the developer question using only the numbered sources below.

Question: {query}

Sources (cite as [cite_N], N is the source number):
{sources}

Rules:
- Structure the answer as: Executive Summary / Analysis / Key Findings /
  Implementation Details / Source References.
- Every factual claim ends with its citation, e.g. "the retry loop lives
  in the router [cite_2]". Citation numbers run from 1 to {total_sources};
  [cite_0] and numbers above {total_sources} are invalid.
- Use at least half the sources; in Source References, briefly note why
  any source went unused.
- If the sources cannot answer the question, say so plainly instead of
  guessing.

Write the answer now."#,
};

pub static ANSWER_VERIFICATION: PromptTemplate = PromptTemplate {
    name: "answer_verification",
    version: 3,
    text: r#"Verify this answer against its sources.

Question: {query}
Answer:
{answer}

Numbered sources:
{sources}

Check: every claim supported by a cited source; citations point at the
right source; the answer is complete for the question; coherent; and
technically accurate.

Reply with JSON only:
{
  "claim_support": 0.0,
  "citation_validity": 0.0,
  "completeness": 0.0,
  "coherence": 0.0,
  "technical_accuracy": 0.0,
  "issues": ["short issue description"]
}"#,
};

pub static JSON_REPAIR: PromptTemplate = PromptTemplate {
    name: "json_repair",
    version: 1,
    text: r#"The following text should be a single JSON value but does not parse.
Return the corrected JSON only, with no commentary.

{input}"#,
};
