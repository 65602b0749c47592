//! Optional pre-generation stage deciding intent, tone and length.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};

use super::prompts::planner_system_prompt;
use super::summarizer::Summary;
use super::WindowView;
use crate::llm_client::{extract_json_object, generate_within, GenerationProvider, GenerationRequest, Message};

pub const MAX_PLANNER_TOKENS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Ack,
    AskFollowup,
    ShareStory,
    Reflect,
    AnswerQuestion,
}

impl Intent {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ack" => Some(Self::Ack),
            "ask_followup" => Some(Self::AskFollowup),
            "share_story" => Some(Self::ShareStory),
            "reflect" => Some(Self::Reflect),
            "answer_question" => Some(Self::AnswerQuestion),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::AskFollowup => "ask_followup",
            Self::ShareStory => "share_story",
            Self::Reflect => "reflect",
            Self::AnswerQuestion => "answer_question",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Playful,
    Caring,
    Neutral,
    Enthusiastic,
}

impl Tone {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "playful" => Some(Self::Playful),
            "caring" => Some(Self::Caring),
            "neutral" => Some(Self::Neutral),
            "enthusiastic" => Some(Self::Enthusiastic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playful => "playful",
            Self::Caring => "caring",
            Self::Neutral => "neutral",
            Self::Enthusiastic => "enthusiastic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Length {
    Minimal,
    Short,
    Medium,
}

impl Length {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "short" => Some(Self::Short),
            "medium" => Some(Self::Medium),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Short => "short",
            Self::Medium => "medium",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub should_respond: bool,
    pub intent: Intent,
    pub tone: Tone,
    pub length: Length,
    pub topic: String,
    pub hint: String,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            should_respond: true,
            intent: Intent::Ack,
            tone: Tone::Neutral,
            length: Length::Short,
            topic: "general".to_string(),
            hint: "be brief and friendly".to_string(),
        }
    }
}

impl Plan {
    /// Maps raw model output into the closed plan domain.
    ///
    /// Output without a JSON object yields the default plan. Within an object,
    /// each missing or out-of-domain field falls back to its default value.
    pub fn from_model_output(raw: &str) -> Self {
        let Some(value) = extract_json_object(raw) else {
            tracing::warn!("Planner output had no JSON object, using default plan");
            return Self::default();
        };
        let defaults = Self::default();
        let text = |key: &str| value.get(key).and_then(|v| v.as_str());

        let should_respond = match value.get("should_respond") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            _ => defaults.should_respond,
        };
        let intent = text("intent").and_then(Intent::parse).unwrap_or(defaults.intent);
        let tone = text("tone").and_then(Tone::parse).unwrap_or(defaults.tone);
        let length = text("response_length")
            .or_else(|| text("length"))
            .and_then(Length::parse)
            .unwrap_or(defaults.length);
        let topic = text("topic")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.topic);
        let hint = text("hint")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or(defaults.hint);

        Self {
            should_respond,
            intent,
            tone,
            length,
            topic,
            hint,
        }
    }

    /// Reason to skip replying under this plan, if any.
    ///
    /// `roll` is a uniform sample in `[0, 1)`; minimal acknowledgements are
    /// dropped when it falls below `minimal_ack_skip_probability`.
    pub fn skip_reason(&self, minimal_ack_skip_probability: f64, roll: f64) -> Option<&'static str> {
        if !self.should_respond {
            return Some("planner declined");
        }
        if self.intent == Intent::Ack
            && self.length == Length::Minimal
            && roll < minimal_ack_skip_probability
        {
            return Some("minimal acknowledgement");
        }
        None
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// Always returns a plan; failures degrade to [`Plan::default`].
    async fn plan(&self, view: &WindowView<'_>, summary: &Summary) -> Plan;
}

/// Planner backed by a generation provider.
pub struct LlmPlanner {
    provider: Arc<dyn GenerationProvider>,
    model: Option<String>,
    timeout: Duration,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn GenerationProvider>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn plan(&self, view: &WindowView<'_>, summary: &Summary) -> Plan {
        let mut messages = view.chat_messages();
        if messages.is_empty() {
            return Plan::default();
        }
        if summary.has_unanswered() {
            messages.push(Message::user(format!(
                "[context] Still unanswered: {}",
                summary.unanswered_questions.join(" | ")
            )));
        }

        let request = GenerationRequest::new(messages, MAX_PLANNER_TOKENS)
            .with_system(planner_system_prompt(Local::now(), view.last_reply()))
            .with_model(self.model.clone())
            .with_temperature(0.2);

        match generate_within(self.provider.as_ref(), &request, self.timeout).await {
            Ok(raw) => {
                tracing::debug!("Planner raw output: {}", raw);
                let plan = Plan::from_model_output(&raw);
                tracing::info!(
                    "Plan: respond={} intent={} tone={} length={} topic={}",
                    plan.should_respond,
                    plan.intent.as_str(),
                    plan.tone.as_str(),
                    plan.length.as_str(),
                    plan.topic
                );
                plan
            }
            Err(e) => {
                tracing::warn!("Planner failed ({}): {}, using default plan", e.category(), e);
                Plan::default()
            }
        }
    }
}

/// Stand-in used when planning is disabled.
#[derive(Debug, Clone, Default)]
pub struct FixedPlanner {
    plan: Plan,
}

impl FixedPlanner {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Planner for FixedPlanner {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn plan(&self, _view: &WindowView<'_>, _summary: &Summary) -> Plan {
        self.plan.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{text_event, ScriptedProvider};
    use crate::conversation::{ContactBook, ConversationWindow};

    #[test]
    fn well_formed_output_is_parsed() {
        let plan = Plan::from_model_output(
            r#"<think>they asked</think>{"should_respond": "yes", "intent": "answer_question", "tone": "caring", "response_length": "medium", "topic": "work", "hint": "be honest"}"#,
        );
        assert!(plan.should_respond);
        assert_eq!(plan.intent, Intent::AnswerQuestion);
        assert_eq!(plan.tone, Tone::Caring);
        assert_eq!(plan.length, Length::Medium);
        assert_eq!(plan.topic, "work");
    }

    #[test]
    fn malformed_output_maps_to_documented_defaults() {
        assert_eq!(Plan::from_model_output("I think you should reply kindly."), Plan::default());
        assert_eq!(Plan::from_model_output(""), Plan::default());

        let plan = Plan::from_model_output(
            r#"{"intent": "rant", "tone": 7, "response_length": "epic", "should_respond": null}"#,
        );
        assert_eq!(plan, Plan::default());

        let mixed = Plan::from_model_output(r#"{"intent": "reflect", "tone": "grumpy"}"#);
        assert_eq!(mixed.intent, Intent::Reflect);
        assert_eq!(mixed.tone, Tone::Neutral);
        assert_eq!(mixed.length, Length::Short);
    }

    #[test]
    fn gate_declines_and_thins_minimal_acks() {
        let declined = Plan {
            should_respond: false,
            ..Plan::default()
        };
        assert_eq!(declined.skip_reason(0.5, 0.99), Some("planner declined"));

        let minimal = Plan {
            length: Length::Minimal,
            ..Plan::default()
        };
        assert_eq!(minimal.skip_reason(0.5, 0.1), Some("minimal acknowledgement"));
        assert_eq!(minimal.skip_reason(0.5, 0.7), None);
        assert_eq!(minimal.skip_reason(0.0, 0.0), None);
        assert_eq!(Plan::default().skip_reason(1.0, 0.0), None);
    }

    #[tokio::test]
    async fn llm_planner_degrades_on_garbage_and_errors() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("no json here".to_string()),
            Err(crate::error::ProviderError::InvalidResponse("empty".to_string())),
        ]));
        let planner = LlmPlanner::new(provider.clone(), None, Duration::from_secs(1));

        let mut window = ConversationWindow::new(10);
        window.ingest(vec![text_event(1, "mom@example.com", "busy today?", false)]);
        let contacts = ContactBook::new(&[], "Meg");
        let view = WindowView::new(&window, &contacts, 10);

        assert_eq!(planner.plan(&view, &Summary::empty()).await, Plan::default());
        assert_eq!(planner.plan(&view, &Summary::empty()).await, Plan::default());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn fixed_planner_never_calls_out() {
        let planner = FixedPlanner::default();
        let window = ConversationWindow::new(3);
        let contacts = ContactBook::new(&[], "Meg");
        let plan = planner
            .plan(&WindowView::new(&window, &contacts, 3), &Summary::empty())
            .await;
        assert_eq!(plan, Plan::default());
        assert_eq!(planner.name(), "fixed");
    }
}
