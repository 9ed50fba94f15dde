//! Main Entrypoint for the VoiceRAG API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Selecting credentials for the Azure OpenAI and Azure AI Search endpoints.
//! 3. Building the realtime middle tier and attaching the RAG tools.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use voicerag_api::{config::Config, router::create_router, state::AppState};
use voicerag_core::{
    credentials::select_credentials,
    rag::attach_rag_tools,
    realtime::{QueryProcessor, RealtimeMiddleTier},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    if config.running_in_production {
        info!("Running in production mode");
    } else {
        info!("Running in development mode, loading from .env file");
    }

    // --- 3. Select Credentials ---
    let credentials = select_credentials(
        config.openai_api_key.take(),
        config.search_api_key.take(),
        config.tenant_id.as_deref(),
    );
    info!(
        llm = credentials.llm.kind(),
        search = credentials.search.kind(),
        "Credentials selected."
    );

    // --- 4. Initialize the Realtime Middle Tier ---
    let mut middle_tier = RealtimeMiddleTier::new(
        credentials.llm,
        config.openai_endpoint.clone(),
        config.realtime_deployment.clone(),
        config.voice_choice.clone(),
    )
    .context("Failed to configure the realtime middle tier")?
    .with_query_timeout(config.query_timeout);
    attach_rag_tools(&mut middle_tier, credentials.search, config.rag.clone());

    let bind_address = config.bind_address;
    info!(
        deployment = %config.realtime_deployment,
        voice = %middle_tier.voice_choice(),
        static_dir = %config.static_dir.display(),
        bind_address = %bind_address,
        "Service configured. Starting server..."
    );

    let app_state = Arc::new(AppState {
        processor: Arc::new(middle_tier),
        config: Arc::new(config),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // --- 6. Start Server ---
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
