// src/lib.rs
// sibyl - Agentic retrieval-augmented reasoning core for codebases

#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod prompts;
pub mod rag;
pub mod retrieval;
pub mod stores;

pub use config::ApiKeys;
pub use engine::{Sibyl, SibylBuilder};
pub use error::{Result, SibylError};
pub use llm::{
    ExecuteOptions, ExecutionResult, LlmClient, ModelInfo, ModelRegistry, Provider, TaskRouter,
    TaskType,
};
pub use rag::{AnswerMode, Citation, ControllerConfig, RagAnswer, RagController, TurnRecord};
pub use retrieval::{
    ContextItemType, ContextRetriever, QueryIntent, RetrievalOptions, RetrievedContextItem,
};
