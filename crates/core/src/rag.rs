//! RAG Tool Attachment
//!
//! Registers the two knowledge-base tools on the realtime middle tier:
//!
//! - `search` queries the index and hands the passages back to the model,
//!   each prefixed with its source id in square brackets.
//! - `report_grounding` looks up the passages the model says it used and
//!   returns them to the caller as the answer's sources.

use crate::{
    credentials::Credential,
    realtime::RealtimeMiddleTier,
    search::{AzureSearchClient, Document, QueryType, SearchClient, SearchRequest, VectorQuery},
    tools::{Tool, ToolRegistry, ToolResult, parameters_schema},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const SEARCH_TOP: usize = 5;
const VECTOR_K: usize = 50;
/// Upper bound on the passages looked up for one grounding report.
const MAX_GROUNDING_SOURCES: usize = 50;

/// Index location and field mapping for the RAG tools.
#[derive(Debug, Clone, PartialEq)]
pub struct RagToolConfig {
    pub search_endpoint: String,
    pub search_index: String,
    pub semantic_configuration: Option<String>,
    pub identifier_field: String,
    pub content_field: String,
    pub embedding_field: String,
    pub title_field: String,
    pub use_vector_query: bool,
}

impl RagToolConfig {
    /// A config with the default field names of an integrated-vectorization index.
    pub fn new(search_endpoint: impl Into<String>, search_index: impl Into<String>) -> Self {
        Self {
            search_endpoint: search_endpoint.into(),
            search_index: search_index.into(),
            semantic_configuration: None,
            identifier_field: "chunk_id".to_string(),
            content_field: "chunk".to_string(),
            embedding_field: "text_vector".to_string(),
            title_field: "title".to_string(),
            use_vector_query: true,
        }
    }

    fn select(&self) -> String {
        [
            self.identifier_field.as_str(),
            self.title_field.as_str(),
            self.content_field.as_str(),
        ]
        .join(",")
    }

    /// The request issued by the `search` tool.
    pub fn search_request(&self, query: &str) -> SearchRequest {
        let (query_type, semantic_configuration) = match &self.semantic_configuration {
            Some(name) => (QueryType::Semantic, Some(name.clone())),
            None => (QueryType::Simple, None),
        };
        let vector_queries = if self.use_vector_query {
            vec![VectorQuery::Text {
                text: query.to_string(),
                k: VECTOR_K,
                fields: self.embedding_field.clone(),
            }]
        } else {
            Vec::new()
        };

        SearchRequest {
            search: query.to_string(),
            query_type,
            semantic_configuration,
            top: SEARCH_TOP,
            select: self.select(),
            search_fields: None,
            vector_queries,
        }
    }

    /// The lookup issued by `report_grounding` for already-validated ids.
    ///
    /// Repeated ids are queried once, and at most `MAX_GROUNDING_SOURCES` are
    /// kept, in the order reported.
    pub fn grounding_request(&self, source_ids: &[&str]) -> SearchRequest {
        let mut unique: Vec<&str> = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            if unique.len() == MAX_GROUNDING_SOURCES {
                break;
            }
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        SearchRequest {
            search: unique.join(" OR "),
            query_type: QueryType::Full,
            semantic_configuration: None,
            top: unique.len(),
            select: self.select(),
            search_fields: Some(self.identifier_field.clone()),
            vector_queries: Vec::new(),
        }
    }
}

/// A knowledge-base passage cited by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub chunk_id: String,
    pub title: String,
    pub chunk: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    /// Search query
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct GroundingArgs {
    /// List of source names from last statement actually used, do not include the ones not used to formulate a response
    sources: Vec<String>,
}

fn field_text(document: &Document, field: &str) -> String {
    match document.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Renders passages as `[<id>]: <content>` blocks separated by `-----`.
pub fn format_search_results(documents: &[Document], config: &RagToolConfig) -> String {
    documents
        .iter()
        .map(|document| {
            format!(
                "[{}]: {}\n-----\n",
                field_text(document, &config.identifier_field),
                field_text(document, &config.content_field)
            )
        })
        .collect()
}

/// Source ids are interpolated into a full Lucene query, so only plain
/// identifier characters are accepted.
pub fn is_valid_source_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '-'))
}

pub struct SearchTool {
    client: Arc<dyn SearchClient>,
    config: Arc<RagToolConfig>,
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the knowledge base. The knowledge base is in English, translate to and formulate the search query in English if the user's question isn't in English."
    }

    fn parameters(&self) -> Value {
        parameters_schema::<SearchArgs>()
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let args: SearchArgs =
            serde_json::from_value(args).context("Invalid arguments for 'search'")?;
        info!(query = %args.query, "Searching knowledge base");

        let documents = self
            .client
            .search(&self.config.search_request(&args.query))
            .await?;
        Ok(ToolResult::ToServer(format_search_results(
            &documents,
            &self.config,
        )))
    }
}

pub struct ReportGroundingTool {
    client: Arc<dyn SearchClient>,
    config: Arc<RagToolConfig>,
}

#[async_trait]
impl Tool for ReportGroundingTool {
    fn name(&self) -> &str {
        "report_grounding"
    }

    fn description(&self) -> &str {
        "Report use of a source from the knowledge base as part of an answer (effectively, cite the source). Sources appear in square brackets before each knowledge base passage. Always use this tool to cite sources when responding with information from the knowledge base."
    }

    fn parameters(&self) -> Value {
        parameters_schema::<GroundingArgs>()
    }

    async fn call(&self, args: Value) -> Result<ToolResult> {
        let args: GroundingArgs =
            serde_json::from_value(args).context("Invalid arguments for 'report_grounding'")?;

        let (valid, rejected): (Vec<&str>, Vec<&str>) = args
            .sources
            .iter()
            .map(String::as_str)
            .partition(|id| is_valid_source_id(id));
        if !rejected.is_empty() {
            warn!(rejected = ?rejected, "Ignoring malformed grounding sources");
        }
        if valid.is_empty() {
            return Ok(ToolResult::ToClient(Vec::new()));
        }
        info!(sources = ?valid, "Grounding sources reported");

        let documents = self
            .client
            .search(&self.config.grounding_request(&valid))
            .await?;
        let sources = documents
            .iter()
            .map(|document| {
                serde_json::to_value(GroundingSource {
                    chunk_id: field_text(document, &self.config.identifier_field),
                    title: field_text(document, &self.config.title_field),
                    chunk: field_text(document, &self.config.content_field),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ToolResult::ToClient(sources))
    }
}

/// Registers `search` and `report_grounding` backed by `client`.
pub fn register_rag_tools(
    registry: &mut ToolRegistry,
    client: Arc<dyn SearchClient>,
    config: RagToolConfig,
) {
    let config = Arc::new(config);
    registry.register(SearchTool {
        client: client.clone(),
        config: config.clone(),
    });
    registry.register(ReportGroundingTool { client, config });
}

/// Connects the middle tier to the configured Azure AI Search index.
pub fn attach_rag_tools(
    middle_tier: &mut RealtimeMiddleTier,
    credential: Credential,
    config: RagToolConfig,
) {
    let client = Arc::new(AzureSearchClient::new(
        config.search_endpoint.clone(),
        config.search_index.clone(),
        credential,
    ));
    info!(
        index = %config.search_index,
        semantic = config.semantic_configuration.is_some(),
        vector = config.use_vector_query,
        "Attaching RAG tools"
    );
    register_rag_tools(middle_tier.tools_mut(), client, config);
}
