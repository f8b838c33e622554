// src/engine.rs
// The assembled engine: registry + router + retriever + controller behind
// one constructor-injected facade exposing the public API.

use crate::config::ApiKeys;
use crate::error::Result;
use crate::llm::{ExecuteOptions, ExecutionResult, ModelRegistry, TaskRouter, TaskType};
use crate::rag::{AnswerMode, ControllerConfig, RagAnswer, RagController};
use crate::retrieval::{ContextRetriever, RetrievalOptions, RetrievedContextItem};
use crate::stores::{EmbeddingStore, KnowledgeGraph, TaskLogStore, WebSearch};
use std::sync::Arc;

/// The agentic RAG engine. Construct via [`Sibyl::builder`].
pub struct Sibyl {
    router: Arc<TaskRouter>,
    retriever: Arc<ContextRetriever>,
    controller: RagController,
}

impl Sibyl {
    pub fn builder() -> SibylBuilder {
        SibylBuilder::default()
    }

    /// Execute one routed LLM task.
    pub async fn execute_task(
        &self,
        task: TaskType,
        prompt: &str,
        system: Option<&str>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        self.router.execute(task, prompt, system, options).await
    }

    /// Hybrid context retrieval for a natural-language prompt.
    pub async fn retrieve_context_for_prompt(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        self.retriever
            .retrieve_context_for_prompt(agent_id, prompt, options)
            .await
    }

    /// Direct retrieval by entity names.
    pub async fn retrieve_context_by_entity_names(
        &self,
        agent_id: &str,
        names: &[String],
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContextItem> {
        self.retriever
            .retrieve_context_by_entity_names(agent_id, names, options)
            .await
    }

    /// Produce a grounded, citation-bearing answer.
    pub async fn answer(
        &self,
        agent_id: &str,
        query: &str,
        mode: AnswerMode,
        options: &RetrievalOptions,
    ) -> RagAnswer {
        self.controller.answer(agent_id, query, mode, options).await
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn retriever(&self) -> &Arc<ContextRetriever> {
        &self.retriever
    }
}

/// Builder wiring the collaborators together. The embedding store and
/// knowledge graph are required; task logs and web search are optional.
#[derive(Default)]
pub struct SibylBuilder {
    registry: Option<Arc<ModelRegistry>>,
    embeddings: Option<Arc<dyn EmbeddingStore>>,
    graph: Option<Arc<dyn KnowledgeGraph>>,
    task_logs: Option<Arc<dyn TaskLogStore>>,
    web: Option<Arc<dyn WebSearch>>,
    controller: ControllerConfig,
}

impl SibylBuilder {
    /// Use a pre-built registry instead of probing the environment.
    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<dyn EmbeddingStore>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn knowledge_graph(mut self, graph: Arc<dyn KnowledgeGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn task_logs(mut self, task_logs: Arc<dyn TaskLogStore>) -> Self {
        self.task_logs = Some(task_logs);
        self
    }

    pub fn web_search(mut self, web: Arc<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn controller_config(mut self, config: ControllerConfig) -> Self {
        self.controller = config;
        self
    }

    /// Assemble the engine. Probes provider availability when no registry
    /// was supplied.
    pub async fn build(self) -> Result<Sibyl> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(ModelRegistry::bootstrap(&ApiKeys::from_env()).await),
        };
        let embeddings = self
            .embeddings
            .ok_or_else(|| crate::error::SibylError::Config("embedding store is required".into()))?;
        let graph = self
            .graph
            .ok_or_else(|| crate::error::SibylError::Config("knowledge graph is required".into()))?;

        let router = Arc::new(TaskRouter::new(registry));
        let mut retriever = ContextRetriever::new(router.clone(), embeddings, graph);
        if let Some(task_logs) = self.task_logs {
            retriever = retriever.with_task_logs(task_logs);
        }
        let retriever = Arc::new(retriever);

        let mut controller = RagController::new(router.clone(), retriever.clone(), self.controller);
        if let Some(web) = self.web {
            controller = controller.with_web_search(web);
        }

        Ok(Sibyl {
            router,
            retriever,
            controller,
        })
    }
}
