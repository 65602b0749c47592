use std::sync::Arc;
use std::time::Duration;

use crate::agent::{
    FixedPlanner, LlmPlanner, Orchestrator, OrchestratorSettings, Planner, Responder, StopSignal,
    Summarizer,
};
use crate::config::AgentConfig;
use crate::conversation::ContactBook;
use crate::error::ConfigurationError;
use crate::knowledge::KnowledgeBase;
use crate::llm_client::{build_provider, GenerationProvider};
use crate::source::{AppleScriptDispatcher, ChatDbSource, Dispatcher, MessageSource};

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub orchestrator: Orchestrator,
}

/// Assembles the orchestrator from configuration. Collaborators can be
/// swapped out before `build`; anything left unset comes from the config.
pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    source: Option<Arc<dyn MessageSource>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    provider: Option<Arc<dyn GenerationProvider>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            source: None,
            dispatcher: None,
            provider: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn GenerationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<BackendRuntime, ConfigurationError> {
        let config = self.config;
        config.validate()?;

        let source = match self.source {
            Some(source) => source,
            None => {
                let path = config.resolved_messages_db_path();
                tracing::info!("Opening message store at {}", path.display());
                Arc::new(ChatDbSource::open(&path, config.chat_name.trim())?)
            }
        };

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(AppleScriptDispatcher::new(
                config.chat_name.trim(),
                Duration::from_secs(config.send_timeout_secs.max(1)),
            )),
        };

        let provider: Arc<dyn GenerationProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::from(build_provider(&config)?),
        };

        let contacts = ContactBook::new(&config.contacts, config.bot_name.clone());
        let knowledge = KnowledgeBase::from_config(config.knowledge_path.as_deref())?;
        let timeout = Duration::from_secs(config.generation_timeout_secs.max(1));

        let summarizer = Summarizer::new(
            provider.clone(),
            Some(config.resolved_summarizer_model()),
            config.summary_threshold,
            timeout,
        );
        let planner: Box<dyn Planner> = if config.enable_planner {
            Box::new(LlmPlanner::new(
                provider.clone(),
                Some(config.resolved_planner_model()),
                timeout,
            ))
        } else {
            Box::new(FixedPlanner::default())
        };
        let responder = Responder::new(
            provider.clone(),
            Some(config.resolved_response_model()),
            config.system_prompt.clone(),
            config.bot_name.clone(),
            knowledge,
            timeout,
        );

        tracing::info!(
            "Monitoring chat '{}' as '{}' via {} provider '{}' (planner: {}, poll every {}s)",
            config.chat_name,
            config.bot_name,
            config.provider.as_str(),
            provider.name(),
            planner.name(),
            config.check_interval_secs
        );

        let orchestrator = Orchestrator::new(
            source,
            dispatcher,
            summarizer,
            planner,
            responder,
            contacts,
            OrchestratorSettings::from_config(&config),
        );

        Ok(BackendRuntime {
            config,
            orchestrator,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig) -> Result<Self, ConfigurationError> {
        BackendRuntimeBuilder::new(config).build()
    }

    /// Drives the orchestrator until `stop` fires. Returns only on stop or on
    /// a startup failure.
    pub async fn run(mut self, stop: StopSignal) -> Result<(), ConfigurationError> {
        self.orchestrator.run(&stop).await
    }
}
