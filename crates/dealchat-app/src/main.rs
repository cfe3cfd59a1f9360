//! Dealchat application binary - composition root.
//!
//! Ties together all Dealchat crates into a single executable:
//! 1. Load configuration from TOML, apply CLI/env overrides
//! 2. Open the SQLite database and optionally seed deals
//! 3. Build the tool registry, rate limiter and model gateway
//! 4. Start the axum REST API server
//!
//! With `--connect` the binary instead runs a terminal chat client
//! against an already running server.

mod cli;
mod terminal;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use dealchat_api::auth::{load_or_generate_token, token_map};
use dealchat_api::{create_router, AppState};
use dealchat_chat::{
    ChatOrchestrator, DealSearchTool, FixedWindowLimiter, ModelGateway, OpenAiGateway,
    OrchestratorDeps, ScriptedGateway, ToolRegistry,
};
use dealchat_core::clock::{Clock, SystemClock};
use dealchat_core::config::{DealchatConfig, ModelConfig};
use dealchat_storage::{ConversationRepository, Database, Deal, DealRepository};

use cli::CliArgs;

/// Expand ~ to home directory in a path string.
fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&path[2..])
    } else {
        PathBuf::from(path)
    }
}

/// Pick the model backend. An unusable OpenAI setup falls back to the
/// offline scripted gateway so the server still starts.
fn build_gateway(config: &ModelConfig) -> Arc<dyn ModelGateway> {
    match config.provider.as_str() {
        "openai" => match OpenAiGateway::from_env(config) {
            Ok(gateway) => {
                tracing::info!(model = %config.model, base_url = %config.base_url, "OpenAI-compatible gateway ready");
                Arc::new(gateway)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Model gateway unavailable, using scripted replies");
                Arc::new(ScriptedGateway::new())
            }
        },
        "scripted" => {
            tracing::info!("Scripted model gateway selected");
            Arc::new(ScriptedGateway::new())
        }
        other => {
            tracing::warn!(provider = %other, "Unknown model provider, using scripted replies");
            Arc::new(ScriptedGateway::new())
        }
    }
}

/// Load a JSON array of deals into the database.
fn seed_deals(deals: &DealRepository, path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let rows: Vec<Deal> = serde_json::from_str(&contents)?;
    for deal in &rows {
        deals.insert(deal)?;
    }
    Ok(rows.len())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = DealchatConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }
    config.general.port = args.resolve_port(config.general.port);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let token_path = resolve_path(&config.auth.token_file);

    if let Some(url) = args.connect.as_deref() {
        let token = match args.token.clone() {
            Some(token) => token,
            None => std::fs::read_to_string(&token_path)?.trim().to_string(),
        };
        terminal::run(url, token).await?;
        return Ok(());
    }

    tracing::info!("Starting Dealchat v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    // Storage.
    let data_dir = resolve_path(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = data_dir.join("dealchat.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let deals = Arc::new(DealRepository::new(Arc::clone(&db)));
    if let Some(path) = args.seed_deals.as_deref() {
        let count = seed_deals(&deals, path)?;
        tracing::info!(count, path = %path.display(), "Deals seeded");
    }

    // Chat.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(FixedWindowLimiter::new(Arc::clone(&clock)));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(DealSearchTool::new(deals, &config.tools)));

    let orchestrator = ChatOrchestrator::new(
        OrchestratorDeps {
            store: Arc::new(ConversationRepository::new(Arc::clone(&db))),
            gateway: build_gateway(&config.model),
            tools: Arc::new(registry),
            limiter: limiter.clone(),
            clock: Arc::clone(&clock),
        },
        config.chat.clone(),
        config.rate_limit.clone(),
    );

    // Auth.
    let local_token = load_or_generate_token(&token_path);
    let tokens = token_map(&local_token, &config.auth);
    tracing::info!(users = tokens.len(), "Bearer tokens registered");

    // === API server ===

    let addr = format!("127.0.0.1:{}", config.general.port);
    let port = config.general.port;
    let state = AppState::new(config, Arc::new(orchestrator), limiter, clock, tokens);
    let router = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind, is another instance running?");
            tracing::error!("Try: DEALCHAT_PORT={} cargo run -p dealchat-app", port.saturating_add(1));
            return Err(e.into());
        }
    };

    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_path_expands_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(resolve_path("~/data"), PathBuf::from(home).join("data"));
        }
        assert_eq!(resolve_path("/var/lib/dealchat"), PathBuf::from("/var/lib/dealchat"));
    }

    #[test]
    fn test_seed_deals_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"d-1","title":"Acme","ebitda":500000.0,"revenue":null,
                 "companyLocation":"Austin, TX","ebitdaMargin":null,"createdAt":1700000000000}}]"#
        )
        .unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        let deals = DealRepository::new(db);
        assert_eq!(seed_deals(&deals, file.path()).unwrap(), 1);
    }

    #[test]
    fn test_unknown_provider_falls_back() {
        let config = ModelConfig {
            provider: "carrier-pigeon".to_string(),
            ..ModelConfig::default()
        };
        // Builds without panicking.
        let _gateway = build_gateway(&config);
    }
}
