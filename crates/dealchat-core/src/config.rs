use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DealchatError, Result};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant for analysing private \
company deals. Answer questions about finance concisely. When the user asks for deals \
matching specific criteria, reply with only a JSON object of the form \
{\"toolName\": \"<tool>\", \"input\": {...}} naming one of the available tools, and \
nothing else.";

/// Top-level configuration for the Dealchat server.
///
/// Loaded from `~/.dealchat/config.toml` by default. Each section corresponds
/// to a bounded context or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealchatConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl DealchatConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DealchatConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DealchatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP listen port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.dealchat/data".to_string(),
            log_level: "info".to_string(),
            port: 3040,
        }
    }
}

/// A static bearer token mapped to a user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
}

/// Bearer-token authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// File holding the generated token for `default_user`.
    pub token_file: String,
    /// Identity bound to the generated token.
    pub default_user: String,
    /// Additional tokens for other users.
    pub tokens: Vec<TokenEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: "~/.dealchat/api_token".to_string(),
            default_user: "local".to_string(),
            tokens: Vec::new(),
        }
    }
}

/// Turn handling limits and prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum user message length in characters.
    pub max_message_chars: usize,
    /// Number of leading characters of the first message used as a title.
    pub title_chars: usize,
    /// Title given to conversations before one is derived.
    pub placeholder_title: String,
    /// System instruction prepended to every prompt.
    pub system_prompt: String,
    /// Chunks buffered between the model reader and a slow consumer.
    pub stream_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 2000,
            title_chars: 30,
            placeholder_title: "New Chat".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            stream_buffer: 32,
        }
    }
}

/// Fixed-window budgets for turns and management routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub turn_limit: u64,
    pub turn_window_ms: u64,
    pub api_limit: u64,
    pub api_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            turn_limit: 10,
            turn_window_ms: 60_000,
            api_limit: 10,
            api_window_ms: 60_000,
        }
    }
}

/// Language model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// "openai" for any OpenAI-compatible endpoint, "scripted" for an offline echo.
    pub provider: String,
    pub base_url: String,
    /// Environment variable holding the API key. The key itself is never stored.
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "DEALCHAT_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

/// Tool execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Results returned when a search omits `limit`.
    pub default_results: usize,
    /// Hard cap on results per search.
    pub max_results: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_results: 10,
            max_results: 25,
        }
    }
}
