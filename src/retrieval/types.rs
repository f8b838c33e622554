// src/retrieval/types.rs
// Retrieval data model: context items, options, query intent

use serde::{Deserialize, Serialize};

/// What kind of thing a retrieved context item is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextItemType {
    FileSnippet,
    FunctionDefinition,
    ClassDefinition,
    InterfaceDefinition,
    EnumDefinition,
    TypeAliasDefinition,
    VariableDefinition,
    KgNodeInfo,
    DirectoryStructure,
    ImportStatement,
    GenericCodeChunk,
    Documentation,
    TaskLog,
}

impl ContextItemType {
    /// Map the indexer's entity kind strings onto item types.
    pub fn from_entity_kind(kind: &str) -> Self {
        match kind.to_lowercase().as_str() {
            "function" | "method" => Self::FunctionDefinition,
            "class" | "struct" => Self::ClassDefinition,
            "interface" | "trait" => Self::InterfaceDefinition,
            "enum" => Self::EnumDefinition,
            "type_alias" | "typedef" | "type" => Self::TypeAliasDefinition,
            "variable" | "const" | "static" => Self::VariableDefinition,
            "import" | "use" => Self::ImportStatement,
            "directory" => Self::DirectoryStructure,
            "doc" | "documentation" | "comment" => Self::Documentation,
            "file" => Self::FileSnippet,
            _ => Self::GenericCodeChunk,
        }
    }
}

/// Structured metadata carried by every context item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kg_node_type: Option<String>,
    /// Set when the item came from direct entity-name lookup.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retrieved_by_name: bool,
    /// Set on the synthetic item returned when retrieval fails outright.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retrieval_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One unit of retrieved context, ready for fusion and synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContextItem {
    #[serde(rename = "type")]
    pub item_type: ContextItemType,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    pub content: String,
    /// Normally in [0,1]; fused scores may exceed 1.
    pub relevance_score: f64,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl RetrievedContextItem {
    pub fn new(
        item_type: ContextItemType,
        source_path: impl Into<String>,
        content: impl Into<String>,
        relevance_score: f64,
    ) -> Self {
        Self {
            item_type,
            source_path: source_path.into(),
            entity_name: None,
            content: content.into(),
            relevance_score,
            metadata: ItemMetadata::default(),
        }
    }

    pub fn with_entity(mut self, entity_name: impl Into<String>) -> Self {
        self.entity_name = Some(entity_name.into());
        self
    }
}

/// Retrieval tuning knobs. Every field has a documented default; the
/// struct is closed, with no dynamic options bag behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrievalOptions {
    /// Vector-similarity results to keep.
    pub top_k_embeddings: usize,
    /// Knowledge-graph results to keep.
    pub top_k_kg: usize,
    /// Restrict the semantic source to these paths when non-empty.
    pub target_file_paths: Vec<String>,
    /// Drop semantic hits below this score.
    pub embedding_score_threshold: f64,
    /// Graph traversal depth hint passed to the KG collaborator.
    pub kg_query_depth: u32,
    /// Run the full hybrid pipeline (KG + semantic) rather than semantic only.
    pub use_hybrid: bool,
    /// Run the AI relevance filter over fused results.
    pub enable_reranking: bool,
    /// Rough character budget for the returned context.
    pub max_context_length: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k_embeddings: 10,
            top_k_kg: 5,
            target_file_paths: Vec::new(),
            embedding_score_threshold: 0.35,
            kg_query_depth: 2,
            use_hybrid: true,
            enable_reranking: true,
            max_context_length: 28_000,
        }
    }
}

impl RetrievalOptions {
    /// Total items the retriever returns after dedup.
    pub fn result_budget(&self) -> usize {
        self.top_k_embeddings + self.top_k_kg
    }
}

/// Intent classes for developer questions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    FindExample,
    RefactorCode,
    DebugError,
    AddFeature,
    UnderstandCode,
    GeneralQuery,
}

impl QueryIntent {
    /// Lenient parse of an LLM-provided label.
    pub fn parse(label: &str) -> Self {
        let l = label.trim().to_lowercase();
        match l.as_str() {
            "find_example" => Self::FindExample,
            "refactor_code" => Self::RefactorCode,
            "debug_error" => Self::DebugError,
            "add_feature" => Self::AddFeature,
            "understand_code" => Self::UnderstandCode,
            _ => Self::GeneralQuery,
        }
    }

    /// Explanation-shaped intents get a gentler AI filter.
    pub fn is_explanatory(self) -> bool {
        matches!(self, Self::UnderstandCode | Self::GeneralQuery)
    }
}
