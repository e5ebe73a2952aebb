//! Main Entrypoint for the Vocab Tutor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the instruction templates from the prompts directory.
//! 3. Selecting the generation backend for the configured provider.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use vocab_tutor_api::{
    config::{Config, Provider},
    router::create_router,
    state::AppState,
};
use vocab_tutor_core::{
    LanguageModel,
    adapter::DEFAULT_GENERAL_INSTRUCTIONS,
    llm_client::{LoggingModel, OpenAICompatibleModel},
    stub::StubLanguageModel,
    tutor::DEFAULT_TUTOR_TEMPLATE,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content.trim().to_string());
        }
    }
    Ok(prompts)
}

/// Builds a chat-completions backend for a provider with an OpenAI-compatible API.
fn openai_compatible(
    api_key: Option<&String>,
    api_base: &str,
    model: &str,
) -> anyhow::Result<Arc<dyn LanguageModel>> {
    let api_key = api_key.context("API key missing for the configured provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_base);
    Ok(Arc::new(OpenAICompatibleModel::new(
        openai_config,
        model.to_string(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Load Instruction Templates ---
    let mut prompts = match load_prompts(&config.prompts_path) {
        Ok(prompts) => prompts,
        Err(e) => {
            warn!(error = %e, "Prompts not loaded, using built-in instructions.");
            HashMap::new()
        }
    };
    let tutor_template = prompts
        .remove("tutor_instructions")
        .unwrap_or_else(|| DEFAULT_TUTOR_TEMPLATE.to_string());
    if !tutor_template.contains("{learner_name}") {
        warn!("tutor_instructions.md has no {{learner_name}} placeholder.");
    }
    let general_instructions = prompts
        .remove("general_instructions")
        .unwrap_or_else(|| DEFAULT_GENERAL_INSTRUCTIONS.to_string());

    // --- 4. Select the Generation Backend ---
    let backend: Arc<dyn LanguageModel> = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            openai_compatible(
                config.openai_api_key.as_ref(),
                "https://api.openai.com/v1/",
                &config.chat_model,
            )?
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            openai_compatible(
                config.gemini_api_key.as_ref(),
                "https://generativelanguage.googleapis.com/v1beta/openai",
                &config.chat_model,
            )?
        }
        Provider::Stub => {
            info!("Using stub provider with canned content.");
            Arc::new(StubLanguageModel::new())
        }
    };

    let app_state = Arc::new(AppState {
        model: Arc::new(LoggingModel::new(backend)),
        tutor_template: Arc::new(tutor_template),
        general_instructions: Arc::new(general_instructions),
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
