//! Search Index Access
//!
//! Defines the `SearchClient` seam used by the RAG tools and its Azure AI
//! Search implementation, which talks to the index over the REST API.

use crate::credentials::{Credential, SEARCH_SCOPE};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// REST API version used for document queries.
pub const SEARCH_API_VERSION: &str = "2024-07-01";

/// A single document returned by the index, keyed by field name.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Simple,
    Semantic,
    Full,
}

/// A vector query whose embedding is computed by the index from text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VectorQuery {
    Text {
        text: String,
        k: usize,
        fields: String,
    },
}

/// The body of a `docs/search` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub search: String,
    pub query_type: QueryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_configuration: Option<String>,
    pub top: usize,
    /// Comma-separated list of fields to return.
    pub select: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_fields: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vector_queries: Vec<VectorQuery>,
}

/// Anything that can answer a search request with documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>>;
}

#[derive(Deserialize)]
struct SearchResponse {
    value: Vec<Document>,
}

/// `SearchClient` backed by an Azure AI Search index.
pub struct AzureSearchClient {
    http: reqwest::Client,
    endpoint: String,
    index: String,
    credential: Credential,
}

impl AzureSearchClient {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>, credential: Credential) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            index: index.into(),
            credential,
        }
    }

    fn search_url(&self) -> String {
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.endpoint.trim_end_matches('/'),
            self.index,
            SEARCH_API_VERSION
        )
    }
}

#[async_trait]
impl SearchClient for AzureSearchClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Document>> {
        let auth = self
            .credential
            .auth_header(SEARCH_SCOPE)
            .await
            .context("Failed to authenticate against the search service")?;

        debug!(index = %self.index, query_type = ?request.query_type, top = request.top, "Querying search index");
        let response = self
            .http
            .post(self.search_url())
            .header(auth.name(), auth.value())
            .json(request)
            .send()
            .await
            .context("Search request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Search index '{}' returned {}: {}",
                self.index,
                status,
                body
            );
        }

        let body: SearchResponse = response
            .json()
            .await
            .context("Failed to decode search response")?;
        Ok(body.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use secrecy::SecretString;
    use serde_json::json;

    fn semantic_request() -> SearchRequest {
        SearchRequest {
            search: "parental leave".to_string(),
            query_type: QueryType::Semantic,
            semantic_configuration: Some("default".to_string()),
            top: 5,
            select: "chunk_id,title,chunk".to_string(),
            search_fields: None,
            vector_queries: vec![VectorQuery::Text {
                text: "parental leave".to_string(),
                k: 50,
                fields: "text_vector".to_string(),
            }],
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(semantic_request()).unwrap();
        assert_eq!(
            body,
            json!({
                "search": "parental leave",
                "queryType": "semantic",
                "semanticConfiguration": "default",
                "top": 5,
                "select": "chunk_id,title,chunk",
                "vectorQueries": [
                    {"kind": "text", "text": "parental leave", "k": 50, "fields": "text_vector"}
                ]
            })
        );
    }

    #[test]
    fn test_request_body_omits_empty_options() {
        let request = SearchRequest {
            search: "a OR b".to_string(),
            query_type: QueryType::Full,
            semantic_configuration: None,
            top: 2,
            select: "chunk_id".to_string(),
            search_fields: Some("chunk_id".to_string()),
            vector_queries: vec![],
        };
        let body = serde_json::to_value(request).unwrap();
        assert_eq!(body["queryType"], "full");
        assert_eq!(body["searchFields"], "chunk_id");
        assert!(body.get("semanticConfiguration").is_none());
        assert!(body.get("vectorQueries").is_none());
    }

    #[tokio::test]
    async fn test_search_posts_to_index() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/indexes/handbook/docs/search")
                    .query_param("api-version", SEARCH_API_VERSION)
                    .header("api-key", "search-key")
                    .json_body_partial(r#"{"search": "parental leave", "queryType": "semantic"}"#);
                then.status(200).json_body(json!({
                    "value": [
                        {"@search.score": 1.2, "chunk_id": "doc_1", "title": "Benefits", "chunk": "Twelve weeks."}
                    ]
                }));
            })
            .await;

        let client = AzureSearchClient::new(
            server.base_url(),
            "handbook",
            Credential::Key(SecretString::from("search-key".to_string())),
        );
        let documents = client.search(&semantic_request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["chunk_id"], "doc_1");
        assert_eq!(documents[0]["chunk"], "Twelve weeks.");
    }

    #[tokio::test]
    async fn test_search_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/indexes/handbook/docs/search");
                then.status(403).body("Forbidden");
            })
            .await;

        let client = AzureSearchClient::new(
            format!("{}/", server.base_url()),
            "handbook",
            Credential::Key(SecretString::from("wrong".to_string())),
        );
        let err = client.search(&semantic_request()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("403"));
        assert!(message.contains("Forbidden"));
    }
}
