//! Credentials for the Azure OpenAI realtime endpoint and the search index.
//!
//! Both services accept either an API key or an Entra ID bearer token. Tokens
//! are obtained from the developer tooling installed on the machine (`azd`,
//! `az`) or from the managed-identity endpoint of the hosting environment; no
//! OAuth exchange happens in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, fmt, process::ExitStatus, sync::Arc, time::Duration};
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info};

/// Token scope for Azure OpenAI.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";
/// Token scope for Azure AI Search.
pub const SEARCH_SCOPE: &str = "https://search.azure.com/.default";

const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);
const REFRESH_MARGIN_SECS: i64 = 300;
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("`{program}` exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Unexpected token payload: {0}")]
    InvalidPayload(String),
    #[error("Managed identity request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Managed identity endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("No credential in the chain produced a token: {0}")]
    Unavailable(String),
}

/// A bearer token and the instant it stops being valid.
#[derive(Debug)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on,
        }
    }

    /// True when the token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.expires_on - margin <= now
    }
}

impl Clone for AccessToken {
    fn clone(&self) -> Self {
        Self::new(self.token.expose_secret(), self.expires_on)
    }
}

/// Anything that can produce a bearer token for a scope.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

// --- Developer tooling ---

async fn run_cli(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, CredentialError> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| CredentialError::Timeout {
            program: program.to_string(),
            timeout,
        })?
        .map_err(|source| CredentialError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(CredentialError::ProcessFailed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Deserialize)]
struct AzdToken {
    token: String,
    #[serde(rename = "expiresOn")]
    expires_on: String,
}

/// Parses the JSON printed by `azd auth token --output json`.
pub(crate) fn parse_azd_token(stdout: &str) -> Result<AccessToken, CredentialError> {
    let payload: AzdToken = serde_json::from_str(stdout)
        .map_err(|e| CredentialError::InvalidPayload(format!("azd output: {e}")))?;
    let expires_on = DateTime::parse_from_rfc3339(&payload.expires_on)
        .map_err(|e| CredentialError::InvalidPayload(format!("azd expiresOn: {e}")))?
        .with_timezone(&Utc);
    Ok(AccessToken::new(payload.token, expires_on))
}

#[derive(Deserialize)]
struct AzToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
    #[serde(rename = "expiresOn")]
    expires_on_local: Option<String>,
}

/// Parses the JSON printed by `az account get-access-token --output json`.
///
/// Newer CLI versions report `expires_on` as a Unix timestamp; older ones only
/// report `expiresOn` as a local wall-clock time.
pub(crate) fn parse_az_token(stdout: &str) -> Result<AccessToken, CredentialError> {
    let payload: AzToken = serde_json::from_str(stdout)
        .map_err(|e| CredentialError::InvalidPayload(format!("az output: {e}")))?;

    let expires_on = match (payload.expires_on_epoch, payload.expires_on_local) {
        (Some(epoch), _) => DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| CredentialError::InvalidPayload(format!("az expires_on: {epoch}")))?,
        (None, Some(local)) => {
            let naive = NaiveDateTime::parse_from_str(&local, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| CredentialError::InvalidPayload(format!("az expiresOn: {e}")))?;
            Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| CredentialError::InvalidPayload(format!("az expiresOn: {local}")))?
                .with_timezone(&Utc)
        }
        (None, None) => {
            return Err(CredentialError::InvalidPayload(
                "az output has no expiry".to_string(),
            ));
        }
    };
    Ok(AccessToken::new(payload.access_token, expires_on))
}

/// Tokens from the Azure Developer CLI (`azd auth token`).
#[derive(Debug, Clone)]
pub struct DeveloperCliCredential {
    tenant_id: Option<String>,
    process_timeout: Duration,
}

impl DeveloperCliCredential {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    fn args(&self, scope: &str) -> Vec<String> {
        let mut args: Vec<String> = ["auth", "token", "--output", "json", "--scope", scope]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(tenant_id) = &self.tenant_id {
            args.push("--tenant-id".to_string());
            args.push(tenant_id.clone());
        }
        args
    }
}

#[async_trait]
impl TokenCredential for DeveloperCliCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let stdout = run_cli("azd", &self.args(scope), self.process_timeout).await?;
        parse_azd_token(&stdout)
    }
}

/// Tokens from the Azure CLI (`az account get-access-token`).
#[derive(Debug, Clone)]
pub struct AzureCliCredential {
    tenant_id: Option<String>,
    process_timeout: Duration,
}

impl AzureCliCredential {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    fn args(&self, scope: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "account",
            "get-access-token",
            "--output",
            "json",
            "--scope",
            scope,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(tenant_id) = &self.tenant_id {
            args.push("--tenant".to_string());
            args.push(tenant_id.clone());
        }
        args
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let stdout = run_cli("az", &self.args(scope), self.process_timeout).await?;
        parse_az_token(&stdout)
    }
}

// --- Managed identity ---

enum IdentitySource {
    /// App Service and Container Apps expose a local endpoint guarded by a header.
    HostedEndpoint { endpoint: String, header: SecretString },
    /// Virtual machines use the instance metadata service.
    Imds { endpoint: String },
}

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
    expires_on: Value,
}

/// Tokens from the managed identity assigned to the hosting environment.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: IdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Picks the hosted endpoint when `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` are
    /// set, otherwise the instance metadata service.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let source = match (non_empty("IDENTITY_ENDPOINT"), non_empty("IDENTITY_HEADER")) {
            (Some(endpoint), Some(header)) => IdentitySource::HostedEndpoint {
                endpoint,
                header: SecretString::from(header),
            },
            _ => IdentitySource::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        };
        Self {
            http: Self::http_client(),
            source,
            client_id: non_empty("AZURE_CLIENT_ID"),
        }
    }

    /// Uses an instance-metadata style endpoint at `endpoint`.
    pub fn with_imds_endpoint(endpoint: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            http: Self::http_client(),
            source: IdentitySource::Imds {
                endpoint: endpoint.into(),
            },
            client_id,
        }
    }

    fn http_client() -> reqwest::Client {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default()
    }
}

fn parse_expires_on(value: &Value) -> Result<DateTime<Utc>, CredentialError> {
    let epoch = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    epoch
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CredentialError::InvalidPayload(format!("expires_on: {value}")))
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope.trim_end_matches("/.default");
        let mut query = vec![("resource", resource.to_string())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }

        let request = match &self.source {
            IdentitySource::HostedEndpoint { endpoint, header } => {
                query.push(("api-version", "2019-08-01".to_string()));
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header.expose_secret())
            }
            IdentitySource::Imds { endpoint } => {
                query.push(("api-version", "2018-02-01".to_string()));
                self.http.get(endpoint).header("Metadata", "true")
            }
        };

        let response = request.query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ManagedIdentityToken = response.json().await?;
        let expires_on = parse_expires_on(&payload.expires_on)?;
        Ok(AccessToken::new(payload.access_token, expires_on))
    }
}

// --- Chain and cache ---

/// Tries each source in order and returns the first token obtained.
pub struct DefaultCredential {
    sources: Vec<(&'static str, Arc<dyn TokenCredential>)>,
}

impl DefaultCredential {
    /// Managed identity, then the Azure CLI, then the Azure Developer CLI.
    pub fn new() -> Self {
        Self::with_sources(vec![
            (
                "ManagedIdentityCredential",
                Arc::new(ManagedIdentityCredential::from_env()) as Arc<dyn TokenCredential>,
            ),
            ("AzureCliCredential", Arc::new(AzureCliCredential::new(None))),
            (
                "AzureDeveloperCliCredential",
                Arc::new(DeveloperCliCredential::new(None)),
            ),
        ])
    }

    pub fn with_sources(sources: Vec<(&'static str, Arc<dyn TokenCredential>)>) -> Self {
        Self { sources }
    }
}

impl Default for DefaultCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut failures = Vec::with_capacity(self.sources.len());
        for (name, source) in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    debug!(credential = name, scope, "Acquired token");
                    return Ok(token);
                }
                Err(e) => {
                    debug!(credential = name, error = %e, "Credential unavailable");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }
        Err(CredentialError::Unavailable(failures.join("; ")))
    }
}

/// Caches tokens per scope until they are close to expiry.
pub struct CachedCredential {
    inner: Arc<dyn TokenCredential>,
    tokens: Mutex<HashMap<String, AccessToken>>,
}

impl CachedCredential {
    pub fn new(inner: Arc<dyn TokenCredential>) -> Self {
        Self {
            inner,
            tokens: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenCredential for CachedCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        // Held across the refresh so concurrent callers share one fetch.
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(scope) {
            if !token.expires_within(ChronoDuration::seconds(REFRESH_MARGIN_SECS), Utc::now()) {
                return Ok(token.clone());
            }
        }
        let fresh = self.inner.get_token(scope).await?;
        tokens.insert(scope.to_string(), fresh.clone());
        Ok(fresh)
    }
}

// --- Selection ---

/// The authentication header to attach to an outgoing request.
pub enum AuthHeader {
    ApiKey(SecretString),
    Bearer(SecretString),
}

impl AuthHeader {
    pub fn name(&self) -> &'static str {
        match self {
            AuthHeader::ApiKey(_) => "api-key",
            AuthHeader::Bearer(_) => "Authorization",
        }
    }

    pub fn value(&self) -> String {
        match self {
            AuthHeader::ApiKey(key) => key.expose_secret().to_string(),
            AuthHeader::Bearer(token) => format!("Bearer {}", token.expose_secret()),
        }
    }
}

/// How a client authenticates: a static key or a token source.
pub enum Credential {
    Key(SecretString),
    Token(Arc<dyn TokenCredential>),
}

impl Credential {
    pub async fn auth_header(&self, scope: &str) -> Result<AuthHeader, CredentialError> {
        match self {
            Credential::Key(key) => Ok(AuthHeader::ApiKey(SecretString::from(
                key.expose_secret().to_string(),
            ))),
            Credential::Token(source) => {
                let token = source.get_token(scope).await?;
                Ok(AuthHeader::Bearer(token.token))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Key(_) => "api-key",
            Credential::Token(_) => "token",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}", self.kind())
    }
}

/// Credentials for the language model and the search index.
#[derive(Debug)]
pub struct CredentialSelection {
    pub llm: Credential,
    pub search: Credential,
}

/// Prefers API keys. When either key is missing, both services share one
/// token credential: the developer CLI bound to `tenant_id` if one is given,
/// otherwise the default chain.
pub fn select_credentials(
    llm_key: Option<SecretString>,
    search_key: Option<SecretString>,
    tenant_id: Option<&str>,
) -> CredentialSelection {
    match (llm_key, search_key) {
        (Some(llm), Some(search)) => CredentialSelection {
            llm: Credential::Key(llm),
            search: Credential::Key(search),
        },
        (llm, search) => {
            let inner: Arc<dyn TokenCredential> = match tenant_id {
                Some(tenant_id) => {
                    info!("Using AzureDeveloperCliCredential with tenant_id {tenant_id}");
                    Arc::new(DeveloperCliCredential::new(Some(tenant_id.to_string())))
                }
                None => {
                    info!("Using DefaultAzureCredential");
                    Arc::new(DefaultCredential::new())
                }
            };
            let shared: Arc<dyn TokenCredential> = Arc::new(CachedCredential::new(inner));
            CredentialSelection {
                llm: llm.map_or_else(|| Credential::Token(shared.clone()), Credential::Key),
                search: search.map_or_else(|| Credential::Token(shared.clone()), Credential::Key),
            }
        }
    }
}
