//! Function tools exposed to the realtime model.

use anyhow::{Context, Result};
use async_openai::types::realtime::ToolDefinition;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// Where the output of a tool call goes.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    /// Returned to the model as the function output.
    ToServer(String),
    /// Surfaced to the caller alongside the answer.
    ToClient(Vec<Value>),
}

impl ToolResult {
    /// The text sent back to the model as the function call output.
    pub fn server_output(&self) -> String {
        match self {
            ToolResult::ToServer(text) => text.clone(),
            ToolResult::ToClient(_) => "OK".to_string(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value) -> Result<ToolResult>;
}

/// Derives the argument schema for `T`, without the document-level keys the
/// realtime API does not expect.
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = schemars::schema_for!(T).to_value();
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

/// Tools available to the model, ordered by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition::Function {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Runs the tool `name` with the raw JSON `arguments` produced by the model.
    pub async fn call(&self, name: &str, arguments: &str) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .with_context(|| format!("Unknown tool '{}'", name))?;
        let args = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments)
                .with_context(|| format!("Invalid arguments for tool '{}'", name))?
        };
        tool.call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    #[serde(deny_unknown_fields)]
    struct EchoArgs {
        /// Text to echo back
        text: String,
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input"
        }

        fn parameters(&self) -> Value {
            parameters_schema::<EchoArgs>()
        }

        async fn call(&self, args: Value) -> Result<ToolResult> {
            let args: EchoArgs = serde_json::from_value(args)?;
            Ok(ToolResult::ToServer(args.text))
        }
    }

    struct CiteTool;

    #[async_trait]
    impl Tool for CiteTool {
        fn name(&self) -> &str {
            "cite"
        }

        fn description(&self) -> &str {
            "Cite sources"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn call(&self, _args: Value) -> Result<ToolResult> {
            Ok(ToolResult::ToClient(vec![json!({"chunk_id": "a"})]))
        }
    }

    #[test]
    fn test_parameters_schema() {
        let schema = parameters_schema::<EchoArgs>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(schema["properties"]["text"]["description"], "Text to echo back");
        assert_eq!(schema["required"], json!(["text"]));
        assert_eq!(schema["additionalProperties"], false);
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
    }

    #[test]
    fn test_definitions_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(CiteTool);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["cite", "echo"]);

        let definitions = serde_json::to_value(registry.definitions()).unwrap();
        assert_eq!(definitions[0]["type"], "function");
        assert_eq!(definitions[0]["name"], "cite");
        assert_eq!(definitions[1]["name"], "echo");
        assert_eq!(definitions[1]["description"], "Echo the input");
    }

    #[tokio::test]
    async fn test_call_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let result = registry.call("echo", r#"{"text": "hello"}"#).await.unwrap();
        assert_eq!(result, ToolResult::ToServer("hello".to_string()));
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.call("missing", "{}").await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool 'missing'"));
    }

    #[tokio::test]
    async fn test_call_rejects_malformed_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let err = registry.call("echo", "{not json").await.unwrap_err();
        assert!(err.to_string().contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn test_empty_arguments_are_an_empty_object() {
        let mut registry = ToolRegistry::new();
        registry.register(CiteTool);
        let result = registry.call("cite", "").await.unwrap();
        assert_eq!(result.server_output(), "OK");
        assert!(matches!(result, ToolResult::ToClient(sources) if sources.len() == 1));
    }
}
