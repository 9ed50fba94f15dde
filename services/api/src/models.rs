//! API Models
//!
//! Request and response bodies of the `/realtime` endpoint, annotated for
//! OpenAPI generation with `utoipa`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema, Debug)]
pub struct RealtimeRequest {
    /// A missing or null message is treated like an empty one.
    #[serde(default)]
    #[schema(example = "What is covered by the health plan?")]
    pub message: Option<String>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct RealtimeResponse {
    pub response: String,
    /// Grounding sources reported by the model, as returned by the search index.
    #[schema(value_type = Vec<Object>)]
    pub sources: Vec<Value>,
    #[schema(example = "alloy")]
    pub voice: String,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub error: String,
}
