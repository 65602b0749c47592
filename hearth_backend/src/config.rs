use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;

pub const CONFIG_FILE_NAME: &str = "hearth_config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    #[serde(alias = "openai_compatible", alias = "gpt")]
    OpenAi,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" | "gpt" | "openai_compatible" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

/// One person in the chat: every handle they write from maps to `alias`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEntry {
    pub alias: String,
    #[serde(default)]
    pub handles: Vec<String>,
    /// Relationship label shown to the models (`mom`, `dad`, ...).
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Chat being watched
    #[serde(default)]
    pub chat_name: String,
    #[serde(default = "default_bot_name", alias = "agent_name")]
    pub bot_name: String,
    #[serde(default)]
    pub messages_db_path: Option<String>,

    // Generation provider
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub llm_api_url: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub response_model: Option<String>,
    #[serde(default)]
    pub planner_model: Option<String>,
    #[serde(default)]
    pub summarizer_model: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    // Persona
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub knowledge_path: Option<String>,
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,

    // Polling and context
    #[serde(default = "default_check_interval", alias = "poll_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    /// Re-summarize every N poll cycles; 0 disables refresh.
    #[serde(default = "default_summary_refresh_polls")]
    pub summary_refresh_polls: u32,

    // Reply decisions
    #[serde(default = "default_true")]
    pub enable_planner: bool,
    #[serde(default = "default_minimal_ack_skip_probability")]
    pub minimal_ack_skip_probability: f64,
    #[serde(default = "default_true")]
    pub startup_reply: bool,
    /// Open a new topic when the startup catch-up has nothing to answer.
    #[serde(default = "default_true")]
    pub startup_topic: bool,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_bot_name() -> String {
    "AI Assistant".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_system_prompt() -> String {
    "You are chatting with your family in a group chat. \
     Keep replies short and natural: one sentence, two at most. \
     Be warm and genuine, never formal, and don't over-explain."
        .to_string()
}

fn default_check_interval() -> u64 {
    20
}

fn default_max_history_size() -> usize {
    40
}

fn default_context_window() -> usize {
    10
}

fn default_summary_threshold() -> usize {
    20
}

fn default_summary_refresh_polls() -> u32 {
    90
}

fn default_true() -> bool {
    true
}

fn default_minimal_ack_skip_probability() -> f64 {
    0.5
}

fn default_send_timeout_secs() -> u64 {
    15
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            chat_name: String::new(),
            bot_name: default_bot_name(),
            messages_db_path: None,
            provider: ProviderKind::default(),
            llm_api_url: None,
            llm_api_key: None,
            response_model: None,
            planner_model: None,
            summarizer_model: None,
            generation_timeout_secs: default_generation_timeout_secs(),
            system_prompt: default_system_prompt(),
            knowledge_path: None,
            contacts: Vec::new(),
            check_interval_secs: default_check_interval(),
            max_history_size: default_max_history_size(),
            context_window: default_context_window(),
            summary_threshold: default_summary_threshold(),
            summary_refresh_polls: default_summary_refresh_polls(),
            enable_planner: true,
            minimal_ack_skip_probability: default_minimal_ack_skip_probability(),
            startup_reply: true,
            startup_topic: true,
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigurationError> {
    raw.trim().parse().map_err(|_| ConfigurationError::Invalid {
        field,
        reason: format!("'{}' is not a valid number", raw.trim()),
    })
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl AgentConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Candidate config files, most specific first.
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = env::var("HEARTH_CONFIG") {
            if !explicit.trim().is_empty() {
                paths.push(PathBuf::from(explicit.trim()));
                return paths;
            }
        }
        paths.push(Self::get_base_dir().join(CONFIG_FILE_NAME));
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        paths
    }

    /// Loads the first config file found, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigurationError> {
        let explicit = env::var("HEARTH_CONFIG").is_ok_and(|p| !p.trim().is_empty());
        let mut config = None;

        for path in Self::config_paths() {
            if !path.exists() {
                if explicit {
                    return Err(ConfigurationError::Unreadable {
                        what: "config",
                        path: path.display().to_string(),
                        reason: "file does not exist".to_string(),
                    });
                }
                continue;
            }
            config = Some(Self::from_file(&path)?);
            tracing::info!("Loaded config from {:?}", path);
            break;
        }

        let mut config = config.unwrap_or_else(|| {
            tracing::warn!("No config file found, using defaults + env vars");
            Self::default()
        });
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let unreadable = |reason: String| ConfigurationError::Unreadable {
            what: "config",
            path: path.display().to_string(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        toml::from_str::<AgentConfig>(&contents).map_err(|e| unreadable(e.to_string()))
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigurationError> {
        self.apply_env_with(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup` (normally the process environment).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("CHAT_NAME").and_then(non_empty) {
            self.chat_name = name;
        }

        if let Some(name) = lookup("BOT_NAME").and_then(non_empty) {
            self.bot_name = name;
        }

        if let Some(raw) = lookup("AI_PROVIDER").and_then(non_empty) {
            self.provider = ProviderKind::parse(&raw).ok_or_else(|| ConfigurationError::Invalid {
                field: "AI_PROVIDER",
                reason: format!("unknown provider '{}' (expected anthropic or openai)", raw),
            })?;
        }

        if let Some(raw) = lookup("CHECK_INTERVAL") {
            self.check_interval_secs = parse_number("CHECK_INTERVAL", &raw)?;
        }

        if let Some(raw) = lookup("MAX_HISTORY_SIZE") {
            self.max_history_size = parse_number("MAX_HISTORY_SIZE", &raw)?;
        }

        if let Some(raw) = lookup("CONTEXT_WINDOW") {
            self.context_window = parse_number("CONTEXT_WINDOW", &raw)?;
        }

        if let Some(url) = lookup("LLM_API_URL").and_then(non_empty) {
            self.llm_api_url = Some(url);
        }

        let provider_key_var = match self.provider {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
        };
        if let Some(key) = lookup("LLM_API_KEY")
            .and_then(non_empty)
            .or_else(|| lookup(provider_key_var).and_then(non_empty))
        {
            self.llm_api_key = Some(key);
        }

        if let Some(model) = lookup("RESPONSE_MODEL").and_then(non_empty) {
            self.response_model = Some(model);
        }

        if let Some(model) = lookup("PLANNER_MODEL").and_then(non_empty) {
            self.planner_model = Some(model);
        }

        if let Some(model) = lookup("SUMMARIZER_MODEL").and_then(non_empty) {
            self.summarizer_model = Some(model);
        }

        if let Some(path) = lookup("MESSAGES_DB_PATH").and_then(non_empty) {
            self.messages_db_path = Some(path);
        }

        if let Some(path) = lookup("KNOWLEDGE_PATH").and_then(non_empty) {
            self.knowledge_path = Some(path);
        }

        if let Some(raw) = lookup("ENABLE_PLANNER") {
            self.enable_planner = parse_flag(&raw);
        }

        if let Some(raw) = lookup("STARTUP_TOPIC") {
            self.startup_topic = parse_flag(&raw);
        }

        Ok(())
    }

    /// Rejects configurations the orchestrator cannot start with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.chat_name.trim().is_empty() {
            return Err(ConfigurationError::MissingChatName);
        }
        if self.check_interval_secs == 0 {
            return Err(ConfigurationError::Invalid {
                field: "check_interval_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.max_history_size == 0 {
            return Err(ConfigurationError::Invalid {
                field: "max_history_size",
                reason: "window capacity must be positive".to_string(),
            });
        }
        if self.context_window == 0 {
            return Err(ConfigurationError::Invalid {
                field: "context_window",
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.minimal_ack_skip_probability) {
            return Err(ConfigurationError::Invalid {
                field: "minimal_ack_skip_probability",
                reason: "must be between 0 and 1".to_string(),
            });
        }
        if self.resolved_api_key().is_none() {
            match self.provider {
                ProviderKind::Anthropic => {
                    return Err(ConfigurationError::MissingCredentials {
                        provider: "anthropic",
                        env_var: "ANTHROPIC_API_KEY",
                    });
                }
                // Local OpenAI-compatible servers usually run without a key.
                ProviderKind::OpenAi if self.resolved_api_url().contains("api.openai.com") => {
                    return Err(ConfigurationError::MissingCredentials {
                        provider: "openai",
                        env_var: "OPENAI_API_KEY",
                    });
                }
                ProviderKind::OpenAi => {}
            }
        }
        Ok(())
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        self.llm_api_key.clone().and_then(non_empty)
    }

    pub fn resolved_api_url(&self) -> String {
        if let Some(url) = self.llm_api_url.clone().and_then(non_empty) {
            return url;
        }
        match self.provider {
            ProviderKind::Anthropic => "https://api.anthropic.com".to_string(),
            ProviderKind::OpenAi => "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn resolved_response_model(&self) -> String {
        self.response_model.clone().and_then(non_empty).unwrap_or_else(|| {
            match self.provider {
                ProviderKind::Anthropic => "claude-3-5-haiku-20241022",
                ProviderKind::OpenAi => "gpt-4",
            }
            .to_string()
        })
    }

    pub fn resolved_planner_model(&self) -> String {
        self.planner_model.clone().and_then(non_empty).unwrap_or_else(|| {
            match self.provider {
                ProviderKind::Anthropic => "claude-3-haiku-20240307".to_string(),
                ProviderKind::OpenAi => self.resolved_response_model(),
            }
        })
    }

    pub fn resolved_summarizer_model(&self) -> String {
        self.summarizer_model.clone().and_then(non_empty).unwrap_or_else(|| {
            match self.provider {
                ProviderKind::Anthropic => "claude-3-haiku-20240307".to_string(),
                ProviderKind::OpenAi => self.resolved_response_model(),
            }
        })
    }

    /// `~/Library/Messages/chat.db` unless overridden.
    pub fn resolved_messages_db_path(&self) -> PathBuf {
        if let Some(path) = self.messages_db_path.clone().and_then(non_empty) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Messages")
            .join("chat.db")
    }
}
