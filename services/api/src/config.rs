use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use voicerag_core::{rag::RagToolConfig, realtime::DEFAULT_QUERY_TIMEOUT};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub static_dir: PathBuf,
    pub log_level: Level,
    pub running_in_production: bool,
    pub openai_endpoint: String,
    pub realtime_deployment: String,
    pub voice_choice: Option<String>,
    pub openai_api_key: Option<SecretString>,
    pub search_api_key: Option<SecretString>,
    pub tenant_id: Option<String>,
    pub rag: RagToolConfig,
    pub query_timeout: Duration,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required_var(name: &str) -> Result<String, ConfigError> {
    optional_var(name).ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Outside production (`RUNNING_IN_PRODUCTION` unset or empty) a `.env`
    /// file is loaded first.
    pub fn from_env() -> Result<Self, ConfigError> {
        let running_in_production = optional_var("RUNNING_IN_PRODUCTION").is_some();
        // Only load from .env in non-test mode to avoid contamination
        if !running_in_production && !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let static_dir = optional_var("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./static"));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let query_timeout = match optional_var("REALTIME_QUERY_TIMEOUT_SECS") {
            Some(secs) => match secs.parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::InvalidValue(
                        "REALTIME_QUERY_TIMEOUT_SECS".to_string(),
                        "timeout must be at least one second".to_string(),
                    ));
                }
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    return Err(ConfigError::InvalidValue(
                        "REALTIME_QUERY_TIMEOUT_SECS".to_string(),
                        e.to_string(),
                    ));
                }
            },
            None => DEFAULT_QUERY_TIMEOUT,
        };

        let openai_endpoint = required_var("AZURE_OPENAI_ENDPOINT")?;
        let realtime_deployment = required_var("AZURE_OPENAI_REALTIME_DEPLOYMENT")?;

        let mut rag = RagToolConfig::new(
            required_var("AZURE_SEARCH_ENDPOINT")?,
            required_var("AZURE_SEARCH_INDEX")?,
        );
        rag.semantic_configuration = optional_var("AZURE_SEARCH_SEMANTIC_CONFIGURATION");
        if let Some(field) = optional_var("AZURE_SEARCH_IDENTIFIER_FIELD") {
            rag.identifier_field = field;
        }
        if let Some(field) = optional_var("AZURE_SEARCH_CONTENT_FIELD") {
            rag.content_field = field;
        }
        if let Some(field) = optional_var("AZURE_SEARCH_EMBEDDING_FIELD") {
            rag.embedding_field = field;
        }
        if let Some(field) = optional_var("AZURE_SEARCH_TITLE_FIELD") {
            rag.title_field = field;
        }
        rag.use_vector_query = std::env::var("AZURE_SEARCH_USE_VECTOR_QUERY")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            bind_address,
            static_dir,
            log_level,
            running_in_production,
            openai_endpoint,
            realtime_deployment,
            voice_choice: optional_var("AZURE_OPENAI_REALTIME_VOICE_CHOICE"),
            openai_api_key: optional_var("AZURE_OPENAI_API_KEY").map(SecretString::from),
            search_api_key: optional_var("AZURE_SEARCH_API_KEY").map(SecretString::from),
            tenant_id: optional_var("AZURE_TENANT_ID"),
            rag,
            query_timeout,
        })
    }
}
