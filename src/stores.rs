// src/stores.rs
// Collaborator contracts: the embedding store, knowledge graph, task log
// store, and web search live outside this crate and are injected as trait
// objects. All operations are scoped by agent id; no cross-agent reads.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One similar-code hit from the agent-scoped embedding store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub file_path_relative: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub chunk_text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Entity kind as the indexer recorded it ("function", "class", ...).
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

/// A knowledge-graph node: a code entity with observations attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgNode {
    pub name: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

/// One persisted task log entry (optional collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One external web search hit (optional collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Agent-scoped vector similarity over indexed code chunks.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn retrieve_similar_code_chunks(
        &self,
        agent_id: &str,
        query: &str,
        top_k: usize,
        target_paths: Option<&[String]>,
    ) -> Result<Vec<CodeChunk>>;
}

/// Agent-scoped knowledge graph of code entities. The natural-language
/// translation to graph operations happens behind `query_natural_language`.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn query_natural_language(&self, agent_id: &str, query: &str) -> Result<Vec<KgNode>>;

    /// `"key:value key:value"` structured search.
    async fn search_nodes(&self, agent_id: &str, query: &str) -> Result<Vec<KgNode>>;

    async fn open_nodes(&self, agent_id: &str, names: &[String]) -> Result<Vec<KgNode>>;
}

/// Optional keyword-searchable task log store.
#[async_trait]
pub trait TaskLogStore: Send + Sync {
    async fn get_logs_by_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<TaskLogEntry>>;
}

/// Optional external web search.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kg_node_wire_casing() {
        // The graph collaborator speaks camelCase for entityType
        let node: KgNode = serde_json::from_str(
            r#"{"name": "UserService", "entityType": "class", "observations": ["defined in src/user.rs"]}"#,
        )
        .expect("parse");
        assert_eq!(node.entity_type, "class");
        let round = serde_json::to_value(&node).expect("serialize");
        assert!(round.get("entityType").is_some());
    }

    #[test]
    fn test_chunk_metadata_defaults() {
        let chunk: CodeChunk = serde_json::from_str(
            r#"{"file_path_relative": "src/a.rs", "chunk_text": "fn a() {}", "score": 0.9}"#,
        )
        .expect("parse");
        assert!(chunk.metadata.kind.is_none());
        assert!(chunk.entity_name.is_none());
    }
}
