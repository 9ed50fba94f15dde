//! Realtime Middle Tier
//!
//! Each query runs as a short-lived conversation over the Azure OpenAI
//! realtime WebSocket: the session is configured with the system message,
//! voice and tools, the user's message is added, and responses are requested
//! until the model answers without calling a tool. Tool calls are executed
//! through the `ToolRegistry` between responses.

use crate::{
    credentials::{COGNITIVE_SERVICES_SCOPE, Credential},
    tools::{ToolRegistry, ToolResult},
};
use anyhow::{Context, Result, anyhow, bail};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, instrument};

pub const REALTIME_API_VERSION: &str = "2024-10-01-preview";
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_TOOL_ROUNDS: usize = 8;

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant. Only answer questions based on information you searched in the knowledge base.
Keep answers very short - one sentence if possible. Never reveal technical details about sources.
1. Always use the 'search' tool first
2. Use 'report_grounding' to cite sources
3. If unsure, say you don't know";

/// The answer to a single query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResponse {
    pub text: String,
    pub sources: Vec<Value>,
}

/// Turns a user message into an answer. This is the seam between the HTTP
/// layer and the realtime conversation.
#[async_trait]
pub trait QueryProcessor: Send + Sync {
    async fn process_query(&self, message: &str) -> Result<QueryResponse>;

    /// The voice clients should use when speaking the answer.
    fn voice_choice(&self) -> &str;
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
struct FunctionCall {
    call_id: String,
    name: String,
    arguments: String,
}

/// The subset of server events that drives a conversation turn.
#[derive(Debug, Clone, PartialEq)]
enum TurnEvent {
    Text(String),
    FunctionCall(FunctionCall),
    ResponseDone,
    Failed(String),
}

impl TurnEvent {
    fn from_server_event(event: OAIServerEvent) -> Option<Self> {
        match event {
            OAIServerEvent::ResponseTextDelta(e) => Some(TurnEvent::Text(e.delta)),
            OAIServerEvent::ResponseAudioTranscriptDelta(e) => Some(TurnEvent::Text(e.delta)),
            OAIServerEvent::ResponseOutputItemDone(e) => {
                let item = e.item;
                if !matches!(item.r#type, Some(oai_realtime::ItemType::FunctionCall)) {
                    return None;
                }
                Some(TurnEvent::FunctionCall(FunctionCall {
                    call_id: item.call_id.unwrap_or_default(),
                    name: item.name.unwrap_or_default(),
                    arguments: item.arguments.unwrap_or_default(),
                }))
            }
            OAIServerEvent::ResponseDone(e) => Some(match e.response.status {
                oai_realtime::ResponseStatus::Completed
                | oai_realtime::ResponseStatus::InProgress => TurnEvent::ResponseDone,
                status => TurnEvent::Failed(describe_unfinished(
                    &status,
                    e.response.status_details.as_ref(),
                )),
            }),
            OAIServerEvent::Error(e) => Some(TurnEvent::Failed(e.error.message)),
            _ => None,
        }
    }
}

/// Failed, cancelled and incomplete responses carry no usable answer.
fn describe_unfinished(
    status: &oai_realtime::ResponseStatus,
    details: Option<&oai_realtime::ResponseStatusDetail>,
) -> String {
    use oai_realtime::ResponseStatusDetail as Detail;
    match details {
        Some(Detail::Failed { error: Some(error) }) => {
            format!("response failed: {} ({})", error.message, error.code)
        }
        Some(Detail::Cancelled { reason }) => format!("response cancelled: {}", reason),
        Some(Detail::Incomplete { reason }) => format!("response incomplete: {:?}", reason),
        _ => format!("response ended with status {:?}", status),
    }
}

#[derive(Debug, PartialEq)]
enum TurnStep {
    Continue,
    RunTools(Vec<FunctionCall>),
    Finished,
}

/// Accumulates the answer text, pending tool calls and reported sources.
#[derive(Debug, Default)]
struct ConversationTurn {
    text: String,
    pending: Vec<FunctionCall>,
    sources: Vec<Value>,
    tool_rounds: usize,
}

impl ConversationTurn {
    fn apply(&mut self, event: TurnEvent) -> Result<TurnStep> {
        match event {
            TurnEvent::Text(delta) => {
                self.text.push_str(&delta);
                Ok(TurnStep::Continue)
            }
            TurnEvent::FunctionCall(call) => {
                self.pending.push(call);
                Ok(TurnStep::Continue)
            }
            TurnEvent::ResponseDone if self.pending.is_empty() => Ok(TurnStep::Finished),
            TurnEvent::ResponseDone => {
                self.tool_rounds += 1;
                if self.tool_rounds > MAX_TOOL_ROUNDS {
                    bail!("Model requested more than {} tool rounds", MAX_TOOL_ROUNDS);
                }
                // Only the response that follows the tool outputs is the answer.
                self.text.clear();
                Ok(TurnStep::RunTools(std::mem::take(&mut self.pending)))
            }
            TurnEvent::Failed(message) => bail!("Realtime endpoint reported an error: {}", message),
        }
    }

    fn record(&mut self, result: &ToolResult) {
        if let ToolResult::ToClient(sources) = result {
            self.sources.extend(sources.iter().cloned());
        }
    }

    fn into_response(self) -> QueryResponse {
        QueryResponse {
            text: self.text.trim().to_string(),
            sources: self.sources,
        }
    }
}

/// Client for the Azure OpenAI realtime endpoint with attached tools.
pub struct RealtimeMiddleTier {
    credential: Credential,
    endpoint: String,
    deployment: String,
    voice_choice: String,
    voice: oai_realtime::RealtimeVoice,
    system_message: String,
    tools: ToolRegistry,
    query_timeout: Duration,
}

impl RealtimeMiddleTier {
    /// Creates a middle tier for `deployment` at `endpoint`.
    ///
    /// An unset or empty `voice_choice` selects `alloy`; any other value must
    /// name a voice the realtime API supports.
    pub fn new(
        credential: Credential,
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        voice_choice: Option<String>,
    ) -> Result<Self> {
        let voice_choice = voice_choice
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_VOICE.to_string());
        let voice = serde_json::from_value(Value::String(voice_choice.clone()))
            .with_context(|| format!("Unsupported realtime voice '{}'", voice_choice))?;

        Ok(Self {
            credential,
            endpoint: endpoint.into(),
            deployment: deployment.into(),
            voice_choice,
            voice,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            tools: ToolRegistry::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn set_system_message(&mut self, system_message: impl Into<String>) {
        self.system_message = system_message.into();
    }

    pub fn system_message(&self) -> &str {
        &self.system_message
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    /// The WebSocket URL of the realtime deployment.
    pub fn realtime_url(&self) -> Result<String> {
        let endpoint = self.endpoint.trim_end_matches('/');
        let base = if let Some(host) = endpoint.strip_prefix("https://") {
            format!("wss://{}", host)
        } else if let Some(host) = endpoint.strip_prefix("http://") {
            format!("ws://{}", host)
        } else if endpoint.starts_with("wss://") || endpoint.starts_with("ws://") {
            endpoint.to_string()
        } else {
            bail!("Unsupported realtime endpoint '{}'", self.endpoint);
        };
        Ok(format!(
            "{}/openai/realtime?api-version={}&deployment={}",
            base, REALTIME_API_VERSION, self.deployment
        ))
    }

    fn session_update(&self) -> OAIClientEvent {
        let session = oai_realtime::SessionResource {
            modalities: Some(vec!["text".to_string()]),
            instructions: Some(self.system_message.clone()),
            voice: Some(self.voice.clone()),
            tools: Some(self.tools.definitions()),
            ..Default::default()
        };
        OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session,
            event_id: None,
        })
    }

    #[instrument(name = "realtime_conversation", skip_all, fields(deployment = %self.deployment))]
    async fn run_conversation(&self, message: &str) -> Result<QueryResponse> {
        let mut request = self.realtime_url()?.into_client_request()?;
        let auth = self
            .credential
            .auth_header(COGNITIVE_SERVICES_SCOPE)
            .await
            .context("Failed to authenticate against the realtime endpoint")?;
        request
            .headers_mut()
            .insert(auth.name(), auth.value().parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to the realtime endpoint")?;
        let (mut sink, mut stream) = ws_stream.split();
        info!("Connected to realtime endpoint.");

        send_event(&mut sink, &self.session_update()).await?;
        send_event(&mut sink, &user_message_event(message)).await?;
        send_event(&mut sink, &response_create_event()).await?;

        let mut turn = ConversationTurn::default();
        while let Some(frame) = stream.next().await {
            let text = match frame.context("Realtime connection failed")? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let Ok(server_event) = serde_json::from_str::<OAIServerEvent>(&text) else {
                debug!("Skipping unrecognised realtime event");
                continue;
            };
            let Some(event) = TurnEvent::from_server_event(server_event) else {
                continue;
            };

            match turn.apply(event)? {
                TurnStep::Continue => {}
                TurnStep::RunTools(calls) => {
                    for call in calls {
                        info!(tool = %call.name, "Running tool");
                        let result = self.tools.call(&call.name, &call.arguments).await?;
                        turn.record(&result);
                        send_event(
                            &mut sink,
                            &function_output_event(&call.call_id, result.server_output()),
                        )
                        .await?;
                    }
                    send_event(&mut sink, &response_create_event()).await?;
                }
                TurnStep::Finished => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(turn.into_response());
                }
            }
        }
        bail!("Realtime connection closed before the response completed")
    }
}

#[async_trait]
impl QueryProcessor for RealtimeMiddleTier {
    async fn process_query(&self, message: &str) -> Result<QueryResponse> {
        tokio::time::timeout(self.query_timeout, self.run_conversation(message))
            .await
            .map_err(|_| anyhow!("Realtime query timed out after {:?}", self.query_timeout))?
    }

    fn voice_choice(&self) -> &str {
        &self.voice_choice
    }
}

async fn send_event<S>(sink: &mut S, event: &OAIClientEvent) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sink.send(WsMessage::Text(serde_json::to_string(event)?.into()))
        .await?;
    Ok(())
}

fn empty_item() -> oai_realtime::Item {
    oai_realtime::Item {
        id: None,
        r#type: None,
        status: None,
        role: None,
        content: None,
        call_id: None,
        name: None,
        arguments: None,
        output: None,
    }
}

fn user_message_event(message: &str) -> OAIClientEvent {
    let item = oai_realtime::Item {
        r#type: Some(oai_realtime::ItemType::Message),
        role: Some(oai_realtime::ItemRole::User),
        content: Some(vec![oai_realtime::ItemContent {
            r#type: oai_realtime::ItemContentType::InputText,
            text: Some(message.to_string()),
            audio: None,
            transcript: None,
        }]),
        ..empty_item()
    };
    OAIClientEvent::ConversationItemCreate(oai_realtime::ConversationItemCreateEvent {
        item,
        event_id: None,
        previous_item_id: None,
    })
}

fn function_output_event(call_id: &str, output: String) -> OAIClientEvent {
    let item = oai_realtime::Item {
        r#type: Some(oai_realtime::ItemType::FunctionCallOutput),
        call_id: Some(call_id.to_string()),
        output: Some(output),
        ..empty_item()
    };
    OAIClientEvent::ConversationItemCreate(oai_realtime::ConversationItemCreateEvent {
        item,
        event_id: None,
        previous_item_id: None,
    })
}

fn response_create_event() -> OAIClientEvent {
    OAIClientEvent::ResponseCreate(oai_realtime::ResponseCreateEvent {
        response: None,
        event_id: None,
    })
}
